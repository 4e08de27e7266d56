//! Method level: runs its test cases one after another.

use std::sync::Arc;

use crate::core::execution::case::CaseRunner;
use crate::core::execution::class::ClassInstanceFactory;
use crate::core::execution::context::LevelContext;
use crate::core::execution::failing::fail_test_cases;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::invocation::BeforeAfterTestHook;
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, TestCase, TestMethod};

pub(crate) struct MethodRunner {
    ctx: LevelContext,
    method: Arc<TestMethod>,
    cases: Vec<Arc<TestCase>>,
    factory: Option<Arc<ClassInstanceFactory>>,
}

impl MethodRunner {
    pub fn new(
        ctx: LevelContext,
        method: Arc<TestMethod>,
        cases: Vec<Arc<TestCase>>,
        factory: Option<Arc<ClassInstanceFactory>>,
    ) -> Self {
        Self {
            ctx,
            method,
            cases,
            factory,
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }

    /// Hooks applying to this method's tests: assembly, then class, then
    /// method, each in declared order.
    fn hooks(&self) -> Arc<[Arc<dyn BeforeAfterTestHook>]> {
        let class = &self.method.class;
        class
            .collection
            .assembly
            .hooks
            .iter()
            .chain(&class.hooks)
            .chain(&self.method.hooks)
            .cloned()
            .collect()
    }
}

impl LevelRunner for MethodRunner {
    const LEVEL: Level = Level::Method;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::method_starting(&self.method)
    }

    fn finished(&self, summary: RunSummary) -> MessageBody {
        MessageBody::MethodFinished { summary }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::MethodCleanupFailure { error }
    }

    async fn run_children(&mut self) -> RunSummary {
        let hooks = self.hooks();
        let mut summary = RunSummary::default();
        for case in &self.cases {
            if self.ctx.is_cancelled() {
                break;
            }
            let ctx = self.ctx.child(self.ctx.ids.with_case(case));
            summary += CaseRunner::new(ctx, case.clone(), self.factory.clone(), hooks.clone())
                .run()
                .await;
        }
        summary
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        fail_test_cases(&mut self.ctx, Level::Method, &self.cases, &failure)
    }
}
