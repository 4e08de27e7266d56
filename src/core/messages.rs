//! # Runner Messages Module / 运行器消息模块
//!
//! Immutable records describing everything that happens during a run. A
//! runner creates a message at a specific phase transition and hands it to
//! the [message bus](crate::core::bus); it is never mutated afterwards.
//!
//! 描述运行期间发生的一切的不可变记录。
//! 运行器在特定阶段转换时创建消息并交给消息总线，之后不再修改。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::core::config::{ExplicitOption, ParallelAlgorithm};
use crate::core::failure::{ExceptionInfo, Failure, FailureCause};
use crate::core::models::{
    RunSummary, SourceLocation, Test, TestAssembly, TestCase, TestClass, TestCollection,
    TestMethod, Traits,
};

/// One of the six levels of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Level {
    Assembly,
    Collection,
    Class,
    Method,
    Case,
    Test,
}

impl Level {
    /// The next finer level, if any.
    pub fn child(self) -> Option<Level> {
        match self {
            Level::Assembly => Some(Level::Collection),
            Level::Collection => Some(Level::Class),
            Level::Class => Some(Level::Method),
            Level::Method => Some(Level::Case),
            Level::Case => Some(Level::Test),
            Level::Test => None,
        }
    }
}

/// Coarse classification of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    Starting,
    Finished,
    Passed,
    Failed,
    Skipped,
    NotRun,
    CleanupFailure,
    Error,
    /// Progress notifications: construction, disposal, hooks and output.
    Other,
}

/// Unique IDs of the entity a message is about and of all of its ancestors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct MessageIds {
    pub assembly: String,
    pub collection: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
    pub case: Option<String>,
    pub test: Option<String>,
}

impl MessageIds {
    pub fn for_assembly(assembly: &TestAssembly) -> Self {
        Self {
            assembly: assembly.unique_id.clone(),
            ..Self::default()
        }
    }

    pub fn with_collection(&self, collection: &TestCollection) -> Self {
        Self {
            collection: Some(collection.unique_id.clone()),
            ..self.clone()
        }
    }

    pub fn with_class(&self, class: &TestClass) -> Self {
        Self {
            class: Some(class.unique_id.clone()),
            ..self.clone()
        }
    }

    pub fn with_method(&self, method: &TestMethod) -> Self {
        Self {
            method: Some(method.unique_id.clone()),
            ..self.clone()
        }
    }

    pub fn with_case(&self, case: &TestCase) -> Self {
        Self {
            case: Some(case.unique_id.clone()),
            ..self.clone()
        }
    }

    pub fn with_test(&self, test: &Test) -> Self {
        Self {
            test: Some(test.unique_id.clone()),
            ..self.clone()
        }
    }

    /// The unique ID of the finest entity these IDs identify.
    pub fn leaf(&self) -> &str {
        self.test
            .as_deref()
            .or(self.case.as_deref())
            .or(self.method.as_deref())
            .or(self.class.as_deref())
            .or(self.collection.as_deref())
            .unwrap_or(&self.assembly)
    }
}

/// A message published on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerMessage {
    pub ids: MessageIds,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

impl RunnerMessage {
    pub fn new(ids: MessageIds, body: MessageBody) -> Self {
        Self {
            ids,
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn level(&self) -> Level {
        self.body.level()
    }
}

/// Kind-specific payload of a [`RunnerMessage`].
#[derive(Debug, Clone, Serialize)]
pub enum MessageBody {
    AssemblyStarting {
        assembly_name: String,
        start_time: DateTime<Utc>,
        /// Resolved worker budget; `None` means unlimited.
        max_parallel_threads: Option<usize>,
        parallel_algorithm: ParallelAlgorithm,
        parallelization_enabled: bool,
        explicit_option: ExplicitOption,
    },
    AssemblyFinished {
        summary: RunSummary,
    },
    AssemblyCleanupFailure {
        error: ExceptionInfo,
    },
    CollectionStarting {
        display_name: String,
        traits: Traits,
    },
    CollectionFinished {
        summary: RunSummary,
    },
    CollectionCleanupFailure {
        error: ExceptionInfo,
    },
    ClassStarting {
        class_name: String,
        traits: Traits,
    },
    ClassFinished {
        summary: RunSummary,
    },
    ClassCleanupFailure {
        error: ExceptionInfo,
    },
    MethodStarting {
        method_name: String,
        traits: Traits,
    },
    MethodFinished {
        summary: RunSummary,
    },
    MethodCleanupFailure {
        error: ExceptionInfo,
    },
    CaseStarting {
        display_name: String,
        skip_reason: Option<String>,
        explicit: bool,
        source: Option<SourceLocation>,
        traits: Traits,
    },
    CaseFinished {
        summary: RunSummary,
    },
    CaseCleanupFailure {
        error: ExceptionInfo,
    },
    TestStarting {
        display_name: String,
        explicit: bool,
        timeout: Option<Duration>,
        traits: Traits,
    },
    TestClassConstructionStarting,
    TestClassConstructionFinished,
    TestClassDisposeStarting,
    TestClassDisposeFinished,
    BeforeTestStarting {
        hook: String,
    },
    BeforeTestFinished {
        hook: String,
    },
    AfterTestStarting {
        hook: String,
    },
    AfterTestFinished {
        hook: String,
    },
    TestOutput {
        output: String,
    },
    TestPassed {
        execution_time: Duration,
        output: String,
    },
    TestFailed {
        execution_time: Duration,
        output: String,
        cause: FailureCause,
        error: ExceptionInfo,
    },
    TestSkipped {
        reason: String,
    },
    TestNotRun,
    TestFinished {
        execution_time: Duration,
        output: String,
    },
    TestCleanupFailure {
        error: ExceptionInfo,
    },
    /// Catch-all for failures that belong to no test: orderer failures,
    /// crashed collection tasks, and the last-resort cleanup fallback.
    Error {
        error: ExceptionInfo,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        use MessageBody::*;
        match self {
            AssemblyStarting { .. }
            | CollectionStarting { .. }
            | ClassStarting { .. }
            | MethodStarting { .. }
            | CaseStarting { .. }
            | TestStarting { .. } => MessageKind::Starting,
            AssemblyFinished { .. }
            | CollectionFinished { .. }
            | ClassFinished { .. }
            | MethodFinished { .. }
            | CaseFinished { .. }
            | TestFinished { .. } => MessageKind::Finished,
            AssemblyCleanupFailure { .. }
            | CollectionCleanupFailure { .. }
            | ClassCleanupFailure { .. }
            | MethodCleanupFailure { .. }
            | CaseCleanupFailure { .. }
            | TestCleanupFailure { .. } => MessageKind::CleanupFailure,
            TestPassed { .. } => MessageKind::Passed,
            TestFailed { .. } => MessageKind::Failed,
            TestSkipped { .. } => MessageKind::Skipped,
            TestNotRun => MessageKind::NotRun,
            Error { .. } => MessageKind::Error,
            TestClassConstructionStarting
            | TestClassConstructionFinished
            | TestClassDisposeStarting
            | TestClassDisposeFinished
            | BeforeTestStarting { .. }
            | BeforeTestFinished { .. }
            | AfterTestStarting { .. }
            | AfterTestFinished { .. }
            | TestOutput { .. } => MessageKind::Other,
        }
    }

    /// The level of the entity the message is about. Generic errors are
    /// attributed to the assembly.
    pub fn level(&self) -> Level {
        use MessageBody::*;
        match self {
            AssemblyStarting { .. }
            | AssemblyFinished { .. }
            | AssemblyCleanupFailure { .. }
            | Error { .. } => Level::Assembly,
            CollectionStarting { .. }
            | CollectionFinished { .. }
            | CollectionCleanupFailure { .. } => Level::Collection,
            ClassStarting { .. } | ClassFinished { .. } | ClassCleanupFailure { .. } => {
                Level::Class
            }
            MethodStarting { .. } | MethodFinished { .. } | MethodCleanupFailure { .. } => {
                Level::Method
            }
            CaseStarting { .. } | CaseFinished { .. } | CaseCleanupFailure { .. } => Level::Case,
            _ => Level::Test,
        }
    }

    /// The summary carried by a `*Finished` message.
    pub fn summary(&self) -> Option<&RunSummary> {
        use MessageBody::*;
        match self {
            AssemblyFinished { summary }
            | CollectionFinished { summary }
            | ClassFinished { summary }
            | MethodFinished { summary }
            | CaseFinished { summary } => Some(summary),
            _ => None,
        }
    }

    /// The failure payload of failure-carrying messages.
    pub fn error(&self) -> Option<&ExceptionInfo> {
        use MessageBody::*;
        match self {
            AssemblyCleanupFailure { error }
            | CollectionCleanupFailure { error }
            | ClassCleanupFailure { error }
            | MethodCleanupFailure { error }
            | CaseCleanupFailure { error }
            | TestCleanupFailure { error }
            | TestFailed { error, .. }
            | Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn collection_starting(collection: &TestCollection) -> Self {
        MessageBody::CollectionStarting {
            display_name: collection.display_name.clone(),
            traits: collection.traits.clone(),
        }
    }

    pub fn class_starting(class: &TestClass) -> Self {
        MessageBody::ClassStarting {
            class_name: class.name.clone(),
            traits: class.traits.clone(),
        }
    }

    pub fn method_starting(method: &TestMethod) -> Self {
        MessageBody::MethodStarting {
            method_name: method.name.clone(),
            traits: method.traits.clone(),
        }
    }

    pub fn case_starting(case: &TestCase) -> Self {
        MessageBody::CaseStarting {
            display_name: case.display_name.clone(),
            skip_reason: case.skip_reason.clone(),
            explicit: case.explicit,
            source: case.source.clone(),
            traits: case.traits.clone(),
        }
    }

    pub fn test_starting(test: &Test) -> Self {
        MessageBody::TestStarting {
            display_name: test.display_name.clone(),
            explicit: test.explicit,
            timeout: test.timeout,
            traits: test.traits.clone(),
        }
    }

    pub fn test_failed(failure: &Failure, execution_time: Duration, output: String) -> Self {
        MessageBody::TestFailed {
            execution_time,
            output,
            cause: failure.cause(),
            error: failure.flatten(),
        }
    }
}
