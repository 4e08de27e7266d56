//! # Core Module / 核心模块
//!
//! This module contains the engine itself: the hierarchy model, the event
//! stream and its buses, failure capture, fixtures, ordering, parallelism and
//! the six-level execution state machine.
//!
//! 此模块包含引擎本身：层级模型、事件流及其总线、失败捕获、
//! 夹具、排序、并行度控制以及六层执行状态机。

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod execution;
pub mod failure;
pub mod fixtures;
pub mod invocation;
pub mod messages;
pub mod models;
pub mod parallelism;
pub mod planner;

// Re-exports
pub use aggregator::ExceptionAggregator;
pub use bus::{DirectMessageBus, MessageBus, MessageRecorder, MessageSink, QueuedMessageBus, StopOnFailSink};
pub use config::{ExplicitOption, ParallelAlgorithm, RunnerConfig};
pub use execution::TestExecutor;
pub use failure::{Failure, FailureCause};
pub use messages::{Level, MessageBody, MessageKind, RunnerMessage};
pub use models::RunSummary;
