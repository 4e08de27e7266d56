//! Collection level: owns the collection fixtures and runs its classes one
//! after another.

use std::sync::Arc;
use tracing::debug;

use crate::core::execution::class::ClassRunner;
use crate::core::execution::context::LevelContext;
use crate::core::execution::failing::fail_test_cases;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::fixtures::{FixtureManager, FixtureScope};
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, TestCase, TestCollection};
use crate::core::planner::{group_by, order_groups};

pub(crate) struct CollectionRunner {
    ctx: LevelContext,
    collection: Arc<TestCollection>,
    cases: Vec<Arc<TestCase>>,
    fixtures: Arc<FixtureManager>,
}

impl CollectionRunner {
    pub fn new(
        ctx: LevelContext,
        collection: Arc<TestCollection>,
        cases: Vec<Arc<TestCase>>,
        fixtures: Arc<FixtureManager>,
    ) -> Self {
        Self {
            ctx,
            collection,
            cases,
            fixtures,
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }
}

impl LevelRunner for CollectionRunner {
    const LEVEL: Level = Level::Collection;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::collection_starting(&self.collection)
    }

    fn finished(&self, summary: RunSummary) -> MessageBody {
        MessageBody::CollectionFinished { summary }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::CollectionCleanupFailure { error }
    }

    async fn on_starting(&mut self) {
        let explicit = self.ctx.settings.explicit;
        let create = self.cases.iter().any(|case| case.may_run(explicit));
        self.fixtures
            .initialize(&self.collection.fixtures, create, &mut self.ctx.aggregator)
            .await;
    }

    async fn run_children(&mut self) -> RunSummary {
        let groups = group_by(&self.cases, |case| case.class());
        let groups = order_groups(
            &mut self.ctx,
            "Test class",
            self.collection.assembly.class_orderer.as_ref(),
            groups,
        );

        let mut summary = RunSummary::default();
        for (class, cases) in groups {
            if self.ctx.is_cancelled() {
                debug!(collection = %self.collection.display_name, "cancelled; not starting further classes");
                break;
            }
            let ctx = self.ctx.child(self.ctx.ids.with_class(&class));
            let fixtures = Arc::new(FixtureManager::with_gate(
                FixtureScope::Class,
                Some(self.fixtures.clone()),
                self.ctx.settings.gate.clone(),
            ));
            summary += ClassRunner::new(ctx, class, cases, fixtures).run().await;
        }
        summary
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        fail_test_cases(&mut self.ctx, Level::Collection, &self.cases, &failure)
    }

    async fn on_finished(&mut self) {
        self.fixtures.dispose(&mut self.ctx.aggregator).await;
    }
}
