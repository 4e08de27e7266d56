//! # Reporting Module / 报告模块
//!
//! This module turns the engine's event stream into human-readable output.
//! Reporters are ordinary [`MessageSink`](crate::core::bus::MessageSink)s and
//! can be combined with any bus.
//!
//! 此模块将引擎的事件流转换为人类可读的输出。
//! 报告器是普通的消息接收器，可与任意总线组合使用。

pub mod console;

// Re-export common reporting types
pub use console::ConsoleReporter;
