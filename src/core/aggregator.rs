//! # Exception Aggregator Module / 异常聚合器模块
//!
//! Collects failures raised by a unit of work instead of letting them escape
//! as control flow. Each level of the hierarchy owns its own aggregator; a
//! child scope receives a clone so that ambient failures are inherited as an
//! "already failed" condition without the child ever mutating its parent.
//!
//! 收集工作单元产生的失败，而不是让它们作为控制流逃逸。
//! 每个层级拥有自己的聚合器；子作用域获得一个克隆。

use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use crate::core::failure::Failure;

/// Accumulates failures in encounter order.
///
/// Nothing in here can unwind: both returned errors and panics raised by the
/// wrapped work are captured.
#[derive(Debug, Clone, Default)]
pub struct ExceptionAggregator {
    failures: Vec<Failure>,
}

impl ExceptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure.
    pub fn add(&mut self, failure: impl Into<Failure>) {
        self.failures.push(failure.into());
    }

    /// Runs `action`, capturing a returned error or a panic.
    /// Returns the action's value when it succeeded.
    pub fn run<T>(&mut self, action: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.add(error);
                None
            }
            Err(payload) => {
                self.add(Failure::from_panic(payload));
                None
            }
        }
    }

    /// Awaits `action`, capturing a returned error or a panic raised while
    /// polling it.
    pub async fn run_async<T, F>(&mut self, action: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match AssertUnwindSafe(action).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.add(error);
                None
            }
            Err(payload) => {
                self.add(Failure::from_panic(payload));
                None
            }
        }
    }

    pub fn has_exceptions(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The stored failures, in encounter order.
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// `None` when empty, the failure itself when there is exactly one,
    /// otherwise a composite of all of them.
    pub fn to_failure(&self) -> Option<Failure> {
        Failure::collapse(self.failures.clone())
    }

    /// Reads and clears in one step.
    pub fn take(&mut self) -> Option<Failure> {
        Failure::collapse(std::mem::take(&mut self.failures))
    }

    /// Discards everything; used once failures have been reported.
    pub fn clear(&mut self) {
        self.failures.clear();
    }
}
