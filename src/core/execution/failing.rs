//! Reports contained tests as failed without running them, used when a level
//! failed to start. The nested `Starting`/`Finished` structure below the
//! failed level is still published, with one synthetic test per case.

use std::sync::Arc;

use crate::core::execution::context::LevelContext;
use crate::core::failure::Failure;
use crate::core::messages::{Level, MessageBody, MessageIds};
use crate::core::models::{Identified, RunSummary, Test, TestCase};
use crate::core::planner::group_by;

/// Fails every case below the entity `ctx` belongs to, which sits at `level`.
pub(crate) fn fail_test_cases(
    ctx: &mut LevelContext,
    level: Level,
    cases: &[Arc<TestCase>],
    failure: &Failure,
) -> RunSummary {
    match level {
        Level::Assembly => fail_groups(
            ctx,
            cases,
            failure,
            Level::Collection,
            |case| case.collection(),
            |ids, collection| ids.with_collection(collection),
            MessageBody::collection_starting,
            |summary| MessageBody::CollectionFinished { summary },
        ),
        Level::Collection => fail_groups(
            ctx,
            cases,
            failure,
            Level::Class,
            |case| case.class(),
            |ids, class| ids.with_class(class),
            MessageBody::class_starting,
            |summary| MessageBody::ClassFinished { summary },
        ),
        Level::Class => fail_groups(
            ctx,
            cases,
            failure,
            Level::Method,
            |case| &case.method,
            |ids, method| ids.with_method(method),
            MessageBody::method_starting,
            |summary| MessageBody::MethodFinished { summary },
        ),
        Level::Method => {
            let mut total = RunSummary::default();
            for case in cases {
                let mut case_ctx = ctx.child(ctx.ids.with_case(case));
                case_ctx.publish(MessageBody::case_starting(case));
                let summary = fail_tests(&mut case_ctx, &[Test::synthetic(case)], failure);
                case_ctx.publish(MessageBody::CaseFinished { summary });
                total += summary;
            }
            total
        }
        Level::Case => {
            let tests: Vec<Test> = cases.iter().map(Test::synthetic).collect();
            fail_tests(ctx, &tests, failure)
        }
        Level::Test => RunSummary::default(),
    }
}

/// Publishes `Starting`, `Failed` and `Finished` for each test.
pub(crate) fn fail_tests(ctx: &mut LevelContext, tests: &[Test], failure: &Failure) -> RunSummary {
    let mut total = RunSummary::default();
    for test in tests {
        let mut test_ctx = ctx.child(ctx.ids.with_test(test));
        test_ctx.publish(MessageBody::test_starting(test));
        test_ctx.publish(MessageBody::test_failed(failure, Default::default(), String::new()));
        test_ctx.publish(MessageBody::TestFinished {
            execution_time: Default::default(),
            output: String::new(),
        });
        total += RunSummary::failed_test(Default::default());
    }
    total
}

#[allow(clippy::too_many_arguments)]
fn fail_groups<K: Identified>(
    ctx: &mut LevelContext,
    cases: &[Arc<TestCase>],
    failure: &Failure,
    child: Level,
    key: impl Fn(&TestCase) -> &Arc<K>,
    ids: impl Fn(&MessageIds, &K) -> MessageIds,
    starting: impl Fn(&K) -> MessageBody,
    finished: impl Fn(RunSummary) -> MessageBody,
) -> RunSummary {
    let mut total = RunSummary::default();
    for (owner, group) in group_by(cases, key) {
        let mut child_ctx = ctx.child(ids(&ctx.ids, &*owner));
        child_ctx.publish(starting(&*owner));
        let summary = fail_test_cases(&mut child_ctx, child, &group, failure);
        child_ctx.publish(finished(summary));
        total += summary;
    }
    total
}
