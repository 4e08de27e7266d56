//! # Test Execution Engine Module / 测试执行引擎模块
//!
//! Drives already-discovered test cases through the six levels of the
//! hierarchy. Every level runs the same state machine
//! ([`lifecycle::run_level`]); what differs is how a level groups and runs
//! its children. Collections may run in parallel; everything below a
//! collection runs serially.
//!
//! 驱动已发现的测试用例经过六个层级。每个层级运行相同的状态机；
//! 集合可以并行运行，集合以下的一切串行运行。

mod assembly;
mod case;
mod class;
mod collection;
pub(crate) mod context;
mod failing;
pub(crate) mod lifecycle;
mod method;
mod test;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::bus::{DirectMessageBus, MessageBus, MessageSink, QueuedMessageBus, StopOnFailSink};
use crate::core::config::RunnerConfig;
use crate::core::messages::MessageIds;
use crate::core::models::{RunSummary, TestAssembly, TestCase};
use crate::core::parallelism::ParallelismController;

use assembly::AssemblyRunner;
use context::{LevelContext, RunSettings};

/// Entry point of the engine.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use test_conductor::{MessageRecorder, RunnerConfig, TestExecutor};
/// # async fn demo(assembly: Arc<test_conductor::models::TestAssembly>,
/// #               cases: Vec<Arc<test_conductor::models::TestCase>>) {
/// let recorder = Arc::new(MessageRecorder::new());
/// let summary = TestExecutor::new(RunnerConfig::default(), recorder.clone())
///     .run(assembly, cases)
///     .await;
/// println!("{} of {} tests failed", summary.failed, summary.total);
/// # }
/// ```
pub struct TestExecutor {
    config: RunnerConfig,
    sink: Arc<dyn MessageSink>,
    cancellation: CancellationToken,
}

impl TestExecutor {
    pub fn new(config: RunnerConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            config,
            sink,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attaches an external cancellation token, e.g. one wired to Ctrl-C.
    /// Cancelling it stops new work from starting. The engine never cancels
    /// the caller's token itself.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs `cases`, all of which must belong to `assembly`, and returns the
    /// assembly summary once every message has been delivered.
    pub async fn run(&self, assembly: Arc<TestAssembly>, cases: Vec<Arc<TestCase>>) -> RunSummary {
        let (cases, foreign): (Vec<_>, Vec<_>) = cases
            .into_iter()
            .partition(|case| Arc::ptr_eq(&case.collection().assembly, &assembly));
        if !foreign.is_empty() {
            warn!(
                ignored = foreign.len(),
                "ignoring test cases that belong to a different assembly"
            );
        }

        let bus = self.build_bus();
        let controller = ParallelismController::from_config(&self.config);
        let settings = Arc::new(RunSettings {
            explicit: self.config.explicit,
            gate: controller.continuation_gate(),
        });
        let ctx = LevelContext::new(
            MessageIds::for_assembly(&assembly),
            bus.clone(),
            self.cancellation.child_token(),
            settings,
        );

        info!(assembly = %assembly.name, cases = cases.len(), "test run starting");
        let summary = AssemblyRunner::new(ctx, assembly, cases, controller)
            .run()
            .await;

        // Flushing and dropping the queued bus block until the dispatcher is done.
        if let Err(e) = tokio::task::spawn_blocking(move || bus.flush()).await {
            warn!("failed to flush the message bus: {e}");
        }
        info!(
            total = summary.total,
            failed = summary.failed,
            skipped = summary.skipped,
            not_run = summary.not_run,
            elapsed = ?summary.time,
            "test run finished"
        );
        summary
    }

    fn build_bus(&self) -> Arc<dyn MessageBus> {
        let sink: Arc<dyn MessageSink> = if self.config.stop_on_fail {
            Arc::new(StopOnFailSink::new(self.sink.clone()))
        } else {
            self.sink.clone()
        };
        if self.config.synchronous_message_reporting {
            return Arc::new(DirectMessageBus::new(sink));
        }
        match QueuedMessageBus::new(sink.clone(), self.config.message_queue_capacity) {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!("could not start the message dispatch thread, delivering synchronously: {e}");
                Arc::new(DirectMessageBus::new(sink))
            }
        }
    }
}
