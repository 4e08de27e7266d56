//! # Level Lifecycle / 层级生命周期
//!
//! The state machine every level goes through: `Initializing → Running →
//! CleaningUp`. [`run_level`] drives it; a [`LevelRunner`] only supplies the
//! level-specific pieces.
//!
//! 每个层级经历的状态机：初始化 → 运行 → 清理。

use std::future::Future;
use tracing::{debug, error};

use crate::core::execution::context::LevelContext;
use crate::core::failure::{ExceptionInfo, Failure};
use crate::core::messages::{Level, MessageBody};
use crate::core::models::RunSummary;

pub(crate) trait LevelRunner: Send {
    const LEVEL: Level;

    fn context(&mut self) -> &mut LevelContext;

    fn starting(&self) -> MessageBody;

    fn finished(&self, summary: RunSummary) -> MessageBody;

    fn cleanup_failure(&self, error: ExceptionInfo) -> MessageBody;

    /// Level setup after `Starting` was published. Failures go into the
    /// context's aggregator and fail the whole level.
    fn on_starting(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Runs every child group and returns the combined summary.
    fn run_children(&mut self) -> impl Future<Output = RunSummary> + Send;

    /// Reports every contained test as failed with `failure` instead of
    /// running it.
    fn fail_children(&mut self, failure: Failure) -> impl Future<Output = RunSummary> + Send;

    /// Level teardown before `Finished` is published. Failures go into the
    /// context's aggregator and are reported as a cleanup failure.
    fn on_finished(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

pub(crate) async fn run_level<R: LevelRunner>(runner: &mut R) -> RunSummary {
    // Initializing
    let starting = runner.starting();
    deliver(runner.context(), starting);
    runner.on_starting().await;

    // Running
    let summary = if runner.context().is_cancelled() {
        debug!(level = ?R::LEVEL, entity = runner.context().ids.leaf(), "cancelled; skipping children");
        RunSummary::default()
    } else {
        match runner.context().aggregator.take() {
            None => runner.run_children().await,
            Some(failure) => {
                debug!(
                    level = ?R::LEVEL,
                    entity = runner.context().ids.leaf(),
                    "startup failed, failing contained tests: {failure}"
                );
                runner.fail_children(failure).await
            }
        }
    };

    // CleaningUp
    runner.context().aggregator.clear();
    runner.on_finished().await;
    let finished = runner.finished(summary);
    deliver(runner.context(), finished);

    if let Some(failure) = runner.context().aggregator.take() {
        let body = runner.cleanup_failure(failure.flatten());
        report_cleanup_failure(runner.context(), body, failure);
    }
    summary
}

/// Publishes a lifecycle message; a delivery failure is captured as a failure
/// of the current phase.
fn deliver(ctx: &mut LevelContext, body: MessageBody) {
    match ctx.try_publish(body) {
        Ok(true) => {}
        Ok(false) => ctx.cancel(),
        Err(failure) => ctx.aggregator.add(failure),
    }
}

/// Last stop for a failure: the level's cleanup-failure message, then a
/// generic `Error` message, then the log.
fn report_cleanup_failure(ctx: &LevelContext, body: MessageBody, failure: Failure) {
    let handler_failure = match ctx.try_publish(body) {
        Ok(true) => return,
        Ok(false) => return ctx.cancel(),
        Err(handler_failure) => handler_failure,
    };
    let Some(combined) = Failure::collapse(vec![failure, handler_failure]) else {
        return;
    };
    match ctx.try_publish(MessageBody::Error {
        error: combined.flatten(),
    }) {
        Ok(true) => {}
        Ok(false) => ctx.cancel(),
        Err(last) => error!(
            entity = ctx.ids.leaf(),
            "could not report cleanup failure ({combined}): {last}"
        ),
    }
}
