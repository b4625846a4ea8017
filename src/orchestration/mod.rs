//! Orchestration layer.
//!
//! This module drives validated task graphs to completion: the
//! `ExecutionScheduler` dispatches agent attempts, applies the retry
//! policy, gates risky tasks behind human review and hands every terminal
//! state to the `ResultAggregator`, which produces the `ExecutionReport`.

pub mod aggregator;
pub mod retry;
pub mod review_gate;
pub mod scheduler;

pub use aggregator::{ExecutionReport, ResultAggregator, StateCounts, TaskReport};
pub use retry::RetryPolicy;
pub use review_gate::{ReviewDecision, ReviewGate};
pub use scheduler::{ExecutionScheduler, SchedulerConfig, SchedulerEvent};
