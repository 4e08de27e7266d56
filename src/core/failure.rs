//! # Failure Module / 失败模块
//!
//! A [`Failure`] is the engine's notion of an exception: anything raised by
//! user code (a returned error or a panic), by a fixture, or by the engine
//! itself while driving a level. Failures are plain values so that they can
//! be cloned into child scopes, flattened into event payloads and compared in
//! tests.
//!
//! [`Failure`] 是引擎中"异常"的表示：用户代码（返回的错误或 panic）、
//! fixture 或引擎本身在驱动某一层级时产生的任何问题。

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Reserved message prefix that turns a failure into a dynamic skip.
///
/// Any error or panic whose message starts with this token is reported as a
/// skipped test, with the remainder of the message as the skip reason. This is
/// a message convention rather than a type check, so it also collides with
/// any legitimate message that happens to share the prefix.
pub const DYNAMIC_SKIP_TOKEN: &str = "$DynamicSkip$";

/// Builds an error that makes the running test report as skipped.
///
/// ```
/// use test_conductor::failure::skip;
///
/// let err = skip("database not available");
/// assert_eq!(err.to_string(), "$DynamicSkip$database not available");
/// ```
pub fn skip(reason: impl fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("{DYNAMIC_SKIP_TOKEN}{reason}")
}

/// Broad classification of a failure, used to derive the reported cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// An error value returned by user code or by the engine.
    Error,
    /// A panic unwound out of user code (typically a failed assertion).
    Panic,
    /// The test body did not complete within its configured timeout.
    Timeout,
    /// Several failures collapsed into one.
    Aggregate,
}

/// Why a test failed, as reported on the `TestFailed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCause {
    Assertion,
    Exception,
    Timeout,
}

/// A captured failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Name of the error type when known, otherwise a generic label.
    pub type_name: String,
    pub message: String,
    /// Cause chain below the top-level message, outermost first.
    pub trace: Vec<String>,
    /// Nested failures; only populated for [`FailureKind::Aggregate`].
    pub inner: Vec<Failure>,
}

impl Failure {
    /// Creates an error failure with the given type name and message.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            type_name: type_name.into(),
            message: message.into(),
            trace: Vec::new(),
            inner: Vec::new(),
        }
    }

    /// Captures a typed error, keeping its concrete type name and source chain.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            trace,
            ..Self::new(short_type_name(std::any::type_name::<E>()), error.to_string())
        }
    }

    /// Captures a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self {
            kind: FailureKind::Panic,
            ..Self::new("panic", panic_message(payload.as_ref()))
        }
    }

    /// The failure reported when a test body outlives its timeout.
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            ..Self::new(
                "timeout",
                format!(
                    "Test execution timed out after {} milliseconds",
                    limit.as_millis()
                ),
            )
        }
    }

    /// Collapses zero, one or many failures: `None`, the failure itself, or a
    /// composite wrapping all of them in encounter order.
    pub fn collapse(mut failures: Vec<Failure>) -> Option<Failure> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            count => Some(Self {
                kind: FailureKind::Aggregate,
                type_name: "aggregate".to_string(),
                message: format!("{count} failures occurred"),
                trace: Vec::new(),
                inner: failures,
            }),
        }
    }

    /// Returns the skip reason if this failure carries the dynamic-skip token.
    pub fn dynamic_skip_reason(&self) -> Option<&str> {
        if self.kind == FailureKind::Aggregate {
            return None;
        }
        self.message.strip_prefix(DYNAMIC_SKIP_TOKEN)
    }

    /// The cause reported on a `TestFailed` event.
    pub fn cause(&self) -> FailureCause {
        match self.kind {
            FailureKind::Timeout => FailureCause::Timeout,
            FailureKind::Panic => FailureCause::Assertion,
            FailureKind::Error | FailureKind::Aggregate => FailureCause::Exception,
        }
    }

    /// Flattens this failure (and any nested ones) into the parallel lists
    /// carried by events. The root has parent index `-1`; every nested failure
    /// points at the index of the failure that contains it.
    pub fn flatten(&self) -> ExceptionInfo {
        let mut info = ExceptionInfo::default();
        self.flatten_into(&mut info, -1);
        info
    }

    fn flatten_into(&self, info: &mut ExceptionInfo, parent: i32) {
        let index = info.types.len() as i32;
        info.types.push(self.type_name.clone());
        info.messages.push(self.message.clone());
        info.traces.push(if self.trace.is_empty() {
            None
        } else {
            Some(self.trace.join("\n"))
        });
        info.parent_indices.push(parent);
        for inner in &self.inner {
            inner.flatten_into(info, index);
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        for cause in &self.trace {
            write!(f, "\n  caused by: {cause}")?;
        }
        for inner in &self.inner {
            write!(f, "\n  - {inner}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        let error = match error.downcast::<Failure>() {
            Ok(failure) => return failure,
            Err(error) => error,
        };
        if let Some(fixture) = error.downcast_ref::<crate::core::fixtures::FixtureError>() {
            return Failure::from_error(fixture);
        }
        if let Some(config) = error.downcast_ref::<crate::core::config::ConfigError>() {
            return Failure::from_error(config);
        }
        Self {
            trace: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
            ..Self::new("error", error.to_string())
        }
    }
}

/// Exception metadata carried by failure events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub types: Vec<String>,
    pub messages: Vec<String>,
    pub traces: Vec<Option<String>>,
    pub parent_indices: Vec<i32>,
}

impl ExceptionInfo {
    /// The top-level message, if any.
    pub fn message(&self) -> Option<&str> {
        self.messages.first().map(String::as_str)
    }
}

/// Extracts a human-readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn short_type_name(full: &str) -> String {
    full.rsplit("::").next().unwrap_or(full).to_string()
}
