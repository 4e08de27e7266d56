//! Per-level execution context.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::aggregator::ExceptionAggregator;
use crate::core::bus::MessageBus;
use crate::core::config::ExplicitOption;
use crate::core::failure::Failure;
use crate::core::messages::{MessageBody, MessageIds, RunnerMessage};
use crate::core::parallelism::ContinuationGate;

/// Read-only settings shared by every level of one run.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub explicit: ExplicitOption,
    pub gate: ContinuationGate,
}

/// Everything a level needs while it runs. Created right before the level
/// starts and dropped when it finishes; children get their own via
/// [`LevelContext::child`].
pub(crate) struct LevelContext {
    pub ids: MessageIds,
    pub bus: Arc<dyn MessageBus>,
    pub aggregator: ExceptionAggregator,
    pub cancellation: CancellationToken,
    pub settings: Arc<RunSettings>,
}

impl LevelContext {
    pub fn new(
        ids: MessageIds,
        bus: Arc<dyn MessageBus>,
        cancellation: CancellationToken,
        settings: Arc<RunSettings>,
    ) -> Self {
        Self {
            ids,
            bus,
            aggregator: ExceptionAggregator::new(),
            cancellation,
            settings,
        }
    }

    /// A context for a child entity. The child's aggregator starts out with a
    /// copy of this level's failures.
    pub fn child(&self, ids: MessageIds) -> Self {
        Self {
            ids,
            bus: self.bus.clone(),
            aggregator: self.aggregator.clone(),
            cancellation: self.cancellation.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        if !self.cancellation.is_cancelled() {
            debug!(entity = self.ids.leaf(), "message consumer asked to stop; cancelling run");
        }
        self.cancellation.cancel();
    }

    /// Publishes a message, returning the consumer's answer or the failure
    /// raised while delivering it.
    pub fn try_publish(&self, body: MessageBody) -> Result<bool, Failure> {
        let message = RunnerMessage::new(self.ids.clone(), body);
        panic::catch_unwind(AssertUnwindSafe(|| self.bus.publish(message)))
            .map_err(Failure::from_panic)
    }

    /// Publishes a message. A "stop" answer cancels the run; a delivery
    /// failure is captured in this level's aggregator.
    pub fn publish(&mut self, body: MessageBody) -> bool {
        match self.try_publish(body) {
            Ok(true) => true,
            Ok(false) => {
                self.cancel();
                false
            }
            Err(failure) => {
                self.aggregator.add(failure);
                true
            }
        }
    }
}
