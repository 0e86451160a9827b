//! Minstrel core: routing model, resolver and the asynchronous control plane

pub mod control;
pub mod domain;
