//! # Infrastructure Module / 基础设施模块
//!
//! This module provides infrastructure services for the engine.
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the embedding application, tests and benches.
//!
//! 此模块为引擎提供基础设施服务。
//! 库本身只发出 `tracing` 事件；安装订阅者由嵌入的应用、测试和基准负责。

pub mod logging;

pub use logging::init_logging;
