//! Case level: expands the case into concrete tests and runs each of them.

use std::sync::Arc;

use crate::core::execution::class::ClassInstanceFactory;
use crate::core::execution::context::LevelContext;
use crate::core::execution::failing::fail_tests;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::execution::test::TestRunner;
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::invocation::BeforeAfterTestHook;
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, Test, TestCase};

pub(crate) struct CaseRunner {
    ctx: LevelContext,
    case: Arc<TestCase>,
    factory: Option<Arc<ClassInstanceFactory>>,
    hooks: Arc<[Arc<dyn BeforeAfterTestHook>]>,
    tests: Vec<Test>,
}

impl CaseRunner {
    pub fn new(
        ctx: LevelContext,
        case: Arc<TestCase>,
        factory: Option<Arc<ClassInstanceFactory>>,
        hooks: Arc<[Arc<dyn BeforeAfterTestHook>]>,
    ) -> Self {
        Self {
            ctx,
            case,
            factory,
            hooks,
            tests: Vec::new(),
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }
}

impl LevelRunner for CaseRunner {
    const LEVEL: Level = Level::Case;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::case_starting(&self.case)
    }

    fn finished(&self, summary: RunSummary) -> MessageBody {
        MessageBody::CaseFinished { summary }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::CaseCleanupFailure { error }
    }

    async fn on_starting(&mut self) {
        match self.case.tests().await {
            Ok(tests) => self.tests = tests,
            Err(e) => self.ctx.aggregator.add(e),
        }
    }

    async fn run_children(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        for test in std::mem::take(&mut self.tests) {
            if self.ctx.is_cancelled() {
                break;
            }
            let ctx = self.ctx.child(self.ctx.ids.with_test(&test));
            summary += TestRunner::new(ctx, test, self.factory.clone(), self.hooks.clone())
                .run()
                .await;
        }
        summary
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        let tests = if self.tests.is_empty() {
            vec![Test::synthetic(&self.case)]
        } else {
            std::mem::take(&mut self.tests)
        };
        fail_tests(&mut self.ctx, &tests, &failure)
    }
}
