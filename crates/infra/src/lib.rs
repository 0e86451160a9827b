//! Minstrel infrastructure: worker pool and the simulated domain adapter

pub mod adapter;
pub mod worker;
