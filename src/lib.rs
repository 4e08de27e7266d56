//! # Test Conductor Library / Test Conductor 库
//!
//! A hierarchical test execution engine. Given already-discovered test cases
//! it drives them through six nested levels (assembly, collection, class,
//! method, case, test), publishes an ordered stream of lifecycle events,
//! manages scoped fixtures, isolates failures and runs collections in
//! parallel under a configurable budget.
//!
//! 分层测试执行引擎。对已发现的测试用例，按六个嵌套层级驱动执行，
//! 发布有序的生命周期事件流，管理作用域夹具，隔离失败，
//! 并在可配置的预算下并行运行集合。
//!
//! ## Modules / 模块
//!
//! - `core` - Hierarchy model, event stream, fixtures and the execution engine
//! - `infra` - Logging setup
//! - `reporting` - Console reporting of the event stream
//!
//! - `core` - 层级模型、事件流、夹具和执行引擎
//! - `infra` - 日志初始化
//! - `reporting` - 事件流的控制台报告

pub mod core;
pub mod infra;
pub mod reporting;

// Re-export commonly used items
pub use core::{
    aggregator, bus, config, execution, failure, fixtures, invocation, messages, models,
    parallelism, planner,
};
pub use core::{
    ExceptionAggregator, Failure, MessageBody, MessageKind, MessageRecorder, MessageSink,
    RunSummary, RunnerConfig, RunnerMessage, TestExecutor,
};
pub use reporting::ConsoleReporter;
