//! # Test Level / 测试层级
//!
//! The innermost level, where user code actually runs.
//!
//! - **Initializing** decides whether the test runs at all (explicit option,
//!   static skip, skip condition) and, if it does, constructs and initializes
//!   the test-class instance.
//! - **Running** executes the before hooks, the body (raced against its
//!   timeout) and the after hooks of every before hook that completed, then
//!   reports exactly one of not run, skipped, failed or passed.
//! - **CleaningUp** disposes the instance. A disposal failure is reported as a
//!   cleanup failure of the test, never as a test failure.
//!
//! 最内层级，用户代码在此实际运行。

use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::core::execution::class::ClassInstanceFactory;
use crate::core::execution::context::LevelContext;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::fixtures::Instance;
use crate::core::invocation::{BeforeAfterTestHook, Invocation, TestOutput};
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, Test};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Run,
    Skip(String),
    NotRun,
}

pub(crate) struct TestRunner {
    ctx: LevelContext,
    test: Test,
    factory: Option<Arc<ClassInstanceFactory>>,
    hooks: Arc<[Arc<dyn BeforeAfterTestHook>]>,
    disposition: Disposition,
    instance: Option<Instance>,
    output: TestOutput,
    started: Option<Instant>,
    execution_time: Duration,
}

impl TestRunner {
    pub fn new(
        ctx: LevelContext,
        test: Test,
        factory: Option<Arc<ClassInstanceFactory>>,
        hooks: Arc<[Arc<dyn BeforeAfterTestHook>]>,
    ) -> Self {
        let output = TestOutput::live(ctx.bus.clone(), ctx.ids.clone(), ctx.cancellation.clone());
        Self {
            ctx,
            test,
            factory,
            hooks,
            disposition: Disposition::Run,
            instance: None,
            output,
            started: None,
            execution_time: Duration::ZERO,
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn resolve_disposition(&self) -> Result<Disposition, Failure> {
        if !self.ctx.settings.explicit.includes(self.test.explicit) {
            return Ok(Disposition::NotRun);
        }
        if let Some(reason) = &self.test.skip_reason {
            return Ok(Disposition::Skip(reason.clone()));
        }

        let case = &self.test.case;
        let (condition, skip_when_true) = match (&case.skip_when, &case.skip_unless) {
            (None, None) => return Ok(Disposition::Run),
            (Some(_), Some(_)) => {
                return Err(Failure::new(
                    "ConfigurationError",
                    format!(
                        "Test case '{}' sets both a skip-when and a skip-unless condition; only one may be set",
                        case.display_name
                    ),
                ));
            }
            (Some(condition), None) => (condition, true),
            (None, Some(condition)) => (condition, false),
        };
        let Some(reason) = &case.skip_reason else {
            return Err(Failure::new(
                "ConfigurationError",
                format!(
                    "Test case '{}' sets skip condition '{}' without a skip reason",
                    case.display_name, condition.name
                ),
            ));
        };

        let value = match panic::catch_unwind(AssertUnwindSafe(|| (condition.predicate)())) {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => return Err(error.into()),
            Err(payload) => return Err(Failure::from_panic(payload)),
        };
        if value == skip_when_true {
            Ok(Disposition::Skip(reason.clone()))
        } else {
            Ok(Disposition::Run)
        }
    }

    async fn create_instance(&mut self) {
        let Some(factory) = self.factory.clone() else {
            if self.test.case.class().factory.is_some() {
                self.ctx.aggregator.add(Failure::new(
                    "InvalidOperation",
                    format!("No instance of test class '{}' is available", self.test.case.class().name),
                ));
            }
            return;
        };

        self.ctx.publish(MessageBody::TestClassConstructionStarting);
        let instance = self
            .ctx
            .aggregator
            .run(|| factory.definition.create(&factory.args));
        if let Some(instance) = &instance {
            if factory.definition.has_async_lifetime() {
                let gate = self.ctx.settings.gate.clone();
                self.ctx
                    .aggregator
                    .run_async(gate.run(factory.definition.initialize(instance)))
                    .await;
            }
        }
        self.instance = instance;
        self.ctx.publish(MessageBody::TestClassConstructionFinished);
    }

    async fn invoke(&mut self) {
        let gate = self.ctx.settings.gate.clone();

        let mut completed = Vec::with_capacity(self.hooks.len());
        for hook in self.hooks.iter() {
            let name = hook.name().to_string();
            self.ctx.publish(MessageBody::BeforeTestStarting { hook: name.clone() });
            let ran = self
                .ctx
                .aggregator
                .run_async(gate.run(hook.before(&self.test)))
                .await
                .is_some();
            self.ctx.publish(MessageBody::BeforeTestFinished { hook: name });
            if !ran {
                break;
            }
            completed.push(hook.clone());
        }

        if !self.ctx.aggregator.has_exceptions() {
            self.invoke_body().await;
        }

        for hook in completed.iter().rev() {
            let name = hook.name().to_string();
            self.ctx.publish(MessageBody::AfterTestStarting { hook: name.clone() });
            self.ctx
                .aggregator
                .run_async(gate.run(hook.after(&self.test)))
                .await;
            self.ctx.publish(MessageBody::AfterTestFinished { hook: name });
        }
    }

    async fn invoke_body(&mut self) {
        let token = self.ctx.cancellation.child_token();
        let invocation = Invocation {
            test_id: self.test.unique_id.clone(),
            display_name: self.test.display_name.clone(),
            instance: self.instance.clone(),
            args: self.test.args.clone(),
            output: self.output.clone(),
            cancellation: token.clone(),
        };
        let body = self.test.method().body.invoke(invocation);
        let limit = self.test.timeout;

        let outcome = self
            .ctx
            .settings
            .gate
            .run(async move {
                let body = AssertUnwindSafe(body).catch_unwind();
                match limit {
                    Some(limit) => tokio::time::timeout(limit, body).await.map_err(|_| limit),
                    None => Ok(body.await),
                }
            })
            .await;

        match outcome {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => self.ctx.aggregator.add(error),
            Ok(Err(payload)) => self.ctx.aggregator.add(Failure::from_panic(payload)),
            Err(limit) => {
                // Only this test's token: the run itself keeps going.
                token.cancel();
                debug!(test = %self.test.display_name, ?limit, "test timed out");
                self.ctx.aggregator.add(Failure::timeout(limit));
            }
        }
    }

    /// Publishes the terminal outcome for a test that had `failure`.
    fn report_failure(&mut self, failure: Failure) -> RunSummary {
        if let Some(reason) = failure.dynamic_skip_reason() {
            let reason = reason.to_string();
            self.ctx.publish(MessageBody::TestSkipped { reason });
            return RunSummary::skipped_test();
        }
        let output = self.output.contents();
        self.ctx
            .publish(MessageBody::test_failed(&failure, self.execution_time, output));
        RunSummary::failed_test(self.execution_time)
    }
}

impl LevelRunner for TestRunner {
    const LEVEL: Level = Level::Test;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::test_starting(&self.test)
    }

    fn finished(&self, _summary: RunSummary) -> MessageBody {
        MessageBody::TestFinished {
            execution_time: self.execution_time,
            output: self.output.contents(),
        }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::TestCleanupFailure { error }
    }

    async fn on_starting(&mut self) {
        self.started = Some(Instant::now());
        match self.resolve_disposition() {
            Ok(disposition) => self.disposition = disposition,
            Err(failure) => {
                self.ctx.aggregator.add(failure);
                return;
            }
        }
        if self.disposition == Disposition::Run && !self.ctx.is_cancelled() {
            self.create_instance().await;
        }
    }

    async fn run_children(&mut self) -> RunSummary {
        match self.disposition.clone() {
            Disposition::NotRun => {
                self.ctx.publish(MessageBody::TestNotRun);
                RunSummary::not_run_test()
            }
            Disposition::Skip(reason) => {
                self.ctx.publish(MessageBody::TestSkipped { reason });
                RunSummary::skipped_test()
            }
            Disposition::Run => {
                self.invoke().await;
                self.execution_time = self.elapsed();
                match self.ctx.aggregator.take() {
                    Some(failure) => self.report_failure(failure),
                    None => {
                        trace!(test = %self.test.display_name, "passed");
                        let output = self.output.contents();
                        self.ctx.publish(MessageBody::TestPassed {
                            execution_time: self.execution_time,
                            output,
                        });
                        RunSummary::passed_test(self.execution_time)
                    }
                }
            }
        }
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        self.execution_time = self.elapsed();
        self.report_failure(failure)
    }

    async fn on_finished(&mut self) {
        // Work the body left behind must not publish after TestFinished.
        self.output.close();
        let (Some(instance), Some(factory)) = (self.instance.take(), self.factory.clone()) else {
            return;
        };
        let definition = &factory.definition;
        if !definition.is_async_disposable() && !definition.is_disposable() {
            return;
        }
        self.ctx.publish(MessageBody::TestClassDisposeStarting);
        let gate = self.ctx.settings.gate.clone();
        self.ctx
            .aggregator
            .run_async(gate.run(definition.dispose(&instance)))
            .await;
        drop(instance);
        self.ctx.publish(MessageBody::TestClassDisposeFinished);
    }
}
