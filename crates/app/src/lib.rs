//! Minstrel composition root, shared by the `minstrel` binary and the end-to-end tests

pub mod bootstrap;

pub use bootstrap::{assemble, settle_main_connection, spawn, Assembly, Runtime, SettleError};
