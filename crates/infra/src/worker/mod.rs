//! Worker threads that execute adapter jobs off the control loop

pub mod cancel;
pub mod pool;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use pool::{Job, JobTicket, PoolError, WorkerPool};
