//! Class level: owns the class fixtures, resolves the test-class constructor
//! arguments once, and runs its methods one after another.

use std::sync::Arc;

use crate::core::execution::context::LevelContext;
use crate::core::execution::failing::fail_test_cases;
use crate::core::execution::lifecycle::{run_level, LevelRunner};
use crate::core::execution::method::MethodRunner;
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::fixtures::{FixtureArgs, FixtureDefinition, FixtureManager};
use crate::core::messages::{Level, MessageBody};
use crate::core::models::{RunSummary, TestCase, TestClass};
use crate::core::planner::{default_order, group_by, group_in_order, order, order_groups};

/// Builds one test-class instance per test from pre-resolved arguments.
pub(crate) struct ClassInstanceFactory {
    pub definition: Arc<FixtureDefinition>,
    pub args: FixtureArgs,
}

pub(crate) struct ClassRunner {
    ctx: LevelContext,
    class: Arc<TestClass>,
    cases: Vec<Arc<TestCase>>,
    fixtures: Arc<FixtureManager>,
    factory: Option<Arc<ClassInstanceFactory>>,
}

impl ClassRunner {
    pub fn new(
        ctx: LevelContext,
        class: Arc<TestClass>,
        cases: Vec<Arc<TestCase>>,
        fixtures: Arc<FixtureManager>,
    ) -> Self {
        Self {
            ctx,
            class,
            cases,
            fixtures,
            factory: None,
        }
    }

    pub async fn run(mut self) -> RunSummary {
        run_level(&mut self).await
    }
}

impl LevelRunner for ClassRunner {
    const LEVEL: Level = Level::Class;

    fn context(&mut self) -> &mut LevelContext {
        &mut self.ctx
    }

    fn starting(&self) -> MessageBody {
        MessageBody::class_starting(&self.class)
    }

    fn finished(&self, summary: RunSummary) -> MessageBody {
        MessageBody::ClassFinished { summary }
    }

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody {
        MessageBody::ClassCleanupFailure { error }
    }

    async fn on_starting(&mut self) {
        let explicit = self.ctx.settings.explicit;
        let create = self.cases.iter().any(|case| case.may_run(explicit));
        self.fixtures
            .initialize(&self.class.fixtures, create, &mut self.ctx.aggregator)
            .await;

        let Some(definition) = &self.class.factory else {
            return;
        };
        let resolved = definition.constructor().and_then(|constructor| {
            if create {
                self.fixtures
                    .resolve_arguments(&constructor.parameters)
                    .map(Some)
            } else {
                Ok(None)
            }
        });
        match resolved {
            Ok(Some(args)) => {
                self.factory = Some(Arc::new(ClassInstanceFactory {
                    definition: definition.clone(),
                    args,
                }));
            }
            Ok(None) => {}
            Err(e) => self.ctx.aggregator.add(Failure::from_error(&e)),
        }
    }

    async fn run_children(&mut self) -> RunSummary {
        let collection = &self.class.collection;
        let orderer = self
            .class
            .case_orderer
            .as_ref()
            .or(collection.case_orderer.as_ref())
            .or(collection.assembly.case_orderer.as_ref());
        let groups = match orderer {
            Some(_) => {
                let cases = order(&mut self.ctx, "Test case", orderer, self.cases.clone());
                group_in_order(&cases, |case| &case.method)
            }
            None => group_by(&default_order(self.cases.clone()), |case| &case.method),
        };
        let groups = order_groups(
            &mut self.ctx,
            "Test method",
            collection.assembly.method_orderer.as_ref(),
            groups,
        );

        let mut summary = RunSummary::default();
        for (method, cases) in groups {
            if self.ctx.is_cancelled() {
                break;
            }
            let ctx = self.ctx.child(self.ctx.ids.with_method(&method));
            summary += MethodRunner::new(ctx, method, cases, self.factory.clone())
                .run()
                .await;
        }
        summary
    }

    async fn fail_children(&mut self, failure: Failure) -> RunSummary {
        fail_test_cases(&mut self.ctx, Level::Class, &self.cases, &failure)
    }

    async fn on_finished(&mut self) {
        self.fixtures.dispose(&mut self.ctx.aggregator).await;
    }
}
