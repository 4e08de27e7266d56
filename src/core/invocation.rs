//! # Invocation Module / 调用模块
//!
//! The boundary between the engine and user code. For each concrete test the
//! engine hands an [`Invocation`] (the constructed test-class instance, the
//! resolved arguments, an output collector and a per-test cancellation token)
//! to the method's [`TestBody`] and awaits how it completes. It does not know
//! anything else about the shape of the call.
//!
//! 引擎与用户代码之间的边界。引擎为每个具体测试构造 [`Invocation`]，
//! 交给方法的 [`TestBody`] 并等待其完成。

use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::bus::MessageBus;
use crate::core::failure::panic_message;
use crate::core::messages::{MessageBody, MessageIds, RunnerMessage};
use crate::core::models::{Arg, Test};

/// A unit of user code the engine can run.
pub trait TestBody: Send + Sync {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> TestBody for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, anyhow::Result<()>> {
        self(invocation).boxed()
    }
}

/// Adapts a synchronous body. It runs on tokio's blocking pool so that the
/// timeout race still applies to it.
pub fn blocking<F>(body: F) -> impl TestBody
where
    F: Fn(Invocation) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let body = Arc::new(body);
    move |invocation: Invocation| {
        let body = body.clone();
        async move {
            match tokio::task::spawn_blocking(move || body(invocation)).await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    panic::resume_unwind(join_error.into_panic())
                }
                Err(join_error) => Err(anyhow::Error::new(join_error)),
            }
        }
    }
}

/// Everything a test body receives.
pub struct Invocation {
    pub test_id: String,
    pub display_name: String,
    /// The test-class instance; `None` for static classes.
    pub instance: Option<Arc<dyn Any + Send + Sync>>,
    pub args: Vec<Arg>,
    pub output: TestOutput,
    /// Cancelled when this test times out or the run is cancelled.
    pub cancellation: CancellationToken,
}

impl Invocation {
    pub fn new(test: &Test) -> Self {
        Self {
            test_id: test.unique_id.clone(),
            display_name: test.display_name.clone(),
            instance: None,
            args: test.args.clone(),
            output: TestOutput::detached(),
            cancellation: CancellationToken::new(),
        }
    }

    /// The test-class instance as its concrete type.
    pub fn instance<T: Any + Send + Sync>(&self) -> anyhow::Result<Arc<T>> {
        let instance = self
            .instance
            .clone()
            .ok_or_else(|| anyhow::anyhow!("test '{}' has no class instance", self.display_name))?;
        instance.downcast::<T>().map_err(|_| {
            anyhow::anyhow!(
                "test class instance is not a {}",
                std::any::type_name::<T>()
            )
        })
    }

    /// The argument at `index` as its concrete type.
    pub fn arg<T: Any + Send + Sync>(&self, index: usize) -> anyhow::Result<&T> {
        let arg = self
            .args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("test '{}' has no argument {index}", self.display_name))?;
        arg.value.downcast_ref::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "argument {index} is {}, not a {}",
                arg.display,
                std::any::type_name::<T>()
            )
        })
    }
}

#[derive(Clone)]
struct LiveOutput {
    bus: Arc<dyn MessageBus>,
    ids: MessageIds,
    cancellation: CancellationToken,
}

/// Collects text written by a test and forwards each line as a live
/// `TestOutput` message. Once the test has finished the output is closed and
/// later writes are discarded.
#[derive(Clone, Default)]
pub struct TestOutput {
    buffer: Arc<Mutex<String>>,
    live: Option<LiveOutput>,
    closed: Arc<AtomicBool>,
}

impl TestOutput {
    /// An output that only buffers.
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn live(
        bus: Arc<dyn MessageBus>,
        ids: MessageIds,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            buffer: Arc::default(),
            live: Some(LiveOutput {
                bus,
                ids,
                cancellation,
            }),
            closed: Arc::default(),
        }
    }

    /// Stops accepting writes, including from clones still held by work the
    /// test left running. Waits for a write that is being published.
    pub(crate) fn close(&self) {
        let _buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn write_line(&self, line: impl AsRef<str>) {
        // Held across the publish so that close() cannot slip in between.
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return;
        }
        let mut text = line.as_ref().to_string();
        text.push('\n');
        buffer.push_str(&text);

        if let Some(live) = &self.live {
            let message = RunnerMessage::new(live.ids.clone(), MessageBody::TestOutput { output: text });
            match panic::catch_unwind(AssertUnwindSafe(|| live.bus.publish(message))) {
                Ok(true) => {}
                Ok(false) => live.cancellation.cancel(),
                Err(payload) => error!(
                    "message sink panicked on test output: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Code run around every test it applies to. Hooks are gathered from the
/// assembly, the class and the method, in that order.
pub trait BeforeAfterTestHook: Send + Sync {
    fn name(&self) -> &str;

    fn before<'a>(&'a self, test: &'a Test) -> BoxFuture<'a, anyhow::Result<()>>;

    fn after<'a>(&'a self, test: &'a Test) -> BoxFuture<'a, anyhow::Result<()>>;
}
