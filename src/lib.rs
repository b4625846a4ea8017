pub mod agents;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod metrics;
pub mod orchestration;
pub mod retrieval;
pub mod review;
pub mod sandbox;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{ExecutionReport, ExecutionScheduler};
