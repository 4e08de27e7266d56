//! Assembly level: owns the assembly fixtures and hands collections to the
//! [`ParallelismController`].

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::core::execution::collection::CollectionRunner;
use crate::core::execution::context::LevelContext;
use crate::core::execution::failing::fail_test_cases;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::fixtures::{FixtureManager, FixtureScope};
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, TestAssembly, TestCase};
use crate::core::parallelism::ParallelismController;
use crate::core::planner::{group_by, order_groups};

pub(crate) struct AssemblyRunner {
    ctx: LevelContext,
    assembly: Arc<TestAssembly>,
    cases: Vec<Arc<TestCase>>,
    controller: ParallelismController,
    fixtures: Arc<FixtureManager>,
    started: Instant,
}

impl AssemblyRunner {
    pub fn new(
        ctx: LevelContext,
        assembly: Arc<TestAssembly>,
        cases: Vec<Arc<TestCase>>,
        controller: ParallelismController,
    ) -> Self {
        let fixtures = Arc::new(FixtureManager::with_gate(
            FixtureScope::Assembly,
            None,
            ctx.settings.gate.clone(),
        ));
        Self {
            ctx,
            assembly,
            cases,
            controller,
            fixtures,
            started: Instant::now(),
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }

    fn wall_clock(&self, mut summary: RunSummary) -> RunSummary {
        summary.time = self.started.elapsed();
        summary
    }
}

impl LevelRunner for AssemblyRunner {
    const LEVEL: Level = Level::Assembly;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::AssemblyStarting {
            assembly_name: self.assembly.name.clone(),
            start_time: Utc::now(),
            max_parallel_threads: self.controller.budget().limit(),
            parallel_algorithm: self.controller.algorithm(),
            parallelization_enabled: self.controller.parallelization_enabled(),
            explicit_option: self.ctx.settings.explicit,
        }
    }

    fn finished(&self, summary: RunSummary) -> MessageBody {
        MessageBody::AssemblyFinished { summary }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::AssemblyCleanupFailure { error }
    }

    async fn on_starting(&mut self) {
        let explicit = self.ctx.settings.explicit;
        let create = self.cases.iter().any(|case| case.may_run(explicit));
        self.fixtures
            .initialize(&self.assembly.fixtures, create, &mut self.ctx.aggregator)
            .await;
    }

    async fn run_children(&mut self) -> RunSummary {
        let groups = group_by(&self.cases, |case| case.collection());
        let groups = order_groups(
            &mut self.ctx,
            "Test collection",
            self.assembly.collection_orderer.as_ref(),
            groups,
        );
        info!(
            assembly = %self.assembly.name,
            collections = groups.len(),
            cases = self.cases.len(),
            "running assembly"
        );

        let ctx = &self.ctx;
        let fixtures = &self.fixtures;
        let outcome = self
            .controller
            .run(
                groups,
                |(collection, _)| collection.disable_parallelization,
                &ctx.cancellation,
                |(collection, cases)| {
                    let child = ctx.child(ctx.ids.with_collection(&collection));
                    let scope = Arc::new(FixtureManager::with_gate(
                        FixtureScope::Collection,
                        Some(fixtures.clone()),
                        ctx.settings.gate.clone(),
                    ));
                    CollectionRunner::new(child, collection, cases, scope).run()
                },
            )
            .await;

        for failure in outcome.failures {
            error!("collection task panicked: {failure}");
            let failure = Failure {
                message: format!("A test collection crashed: {}", failure.message),
                ..failure
            };
            self.ctx.publish(MessageBody::Error {
                error: failure.flatten(),
            });
        }
        self.wall_clock(outcome.summary)
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        let summary = fail_test_cases(&mut self.ctx, Level::Assembly, &self.cases, &failure);
        self.wall_clock(summary)
    }

    async fn on_finished(&mut self) {
        self.fixtures.dispose(&mut self.ctx.aggregator).await;
    }
}
