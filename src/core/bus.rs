//! # Message Bus Module / 消息总线模块
//!
//! The only channel through which results leave the engine. Publishing is
//! safe from any number of concurrently running collections; delivery to the
//! consumer is serialized so two publishers never interleave.
//!
//! 结果离开引擎的唯一通道。可以从任意数量并发运行的集合中安全发布；
//! 向消费者的投递是串行化的。
//!
//! Two buses are provided:
//!
//! - [`DirectMessageBus`] delivers on the publishing task, under a single lock.
//! - [`QueuedMessageBus`] enqueues into a bounded queue drained by one
//!   dedicated dispatch thread: many producers, exactly one consumer.
//!
//! Both preserve publish order, and both turn a consumer's "stop" answer into
//! a `false` return from [`MessageBus::publish`], which callers must treat as a
//! request to cancel the run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{error, warn};

use crate::core::failure::panic_message;
use crate::core::messages::{MessageKind, RunnerMessage};

/// A consumer of runner messages. Returning `false` asks the run to stop.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, message: &RunnerMessage) -> bool;
}

impl<F> MessageSink for F
where
    F: Fn(&RunnerMessage) -> bool + Send + Sync,
{
    fn on_message(&self, message: &RunnerMessage) -> bool {
        self(message)
    }
}

/// An ordered, thread-safe publish sink.
pub trait MessageBus: Send + Sync {
    /// Publishes a message. `false` means the consumer wants to stop.
    ///
    /// Publishing may block the calling thread: the direct bus runs the sink
    /// inline, and the queued bus waits for room once its queue is full. A slow
    /// sink therefore stalls the runtime workers that publish to it.
    fn publish(&self, message: RunnerMessage) -> bool;

    /// Blocks until every message published so far has been delivered.
    fn flush(&self) {}
}

/// Delivers each message on the caller's thread while holding one lock.
pub struct DirectMessageBus {
    sink: Arc<dyn MessageSink>,
    lock: Mutex<()>,
}

impl DirectMessageBus {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            lock: Mutex::new(()),
        }
    }
}

impl MessageBus for DirectMessageBus {
    fn publish(&self, message: RunnerMessage) -> bool {
        // A sink that panicked poisons the lock; later messages still go out.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sink.on_message(&message)
    }
}

enum Envelope {
    Message(RunnerMessage),
    Flush(mpsc::Sender<()>),
}

/// Default bounded queue size of [`QueuedMessageBus`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Enqueues messages for a single dedicated dispatch thread.
///
/// The "continue" answer is sticky: once the consumer has asked to stop,
/// every later `publish` returns `false`. A panicking sink is logged and
/// dispatch carries on with the next message. Dropping the bus drains the
/// queue and joins the dispatch thread.
pub struct QueuedMessageBus {
    sender: Option<SyncSender<Envelope>>,
    worker: Option<JoinHandle<()>>,
    keep_running: Arc<AtomicBool>,
}

impl QueuedMessageBus {
    pub fn new(sink: Arc<dyn MessageSink>, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Envelope>(capacity.max(1));
        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = keep_running.clone();

        let worker = thread::Builder::new()
            .name("conductor-message-bus".into())
            .spawn(move || {
                for envelope in receiver {
                    match envelope {
                        Envelope::Message(message) => {
                            let delivered =
                                panic::catch_unwind(AssertUnwindSafe(|| sink.on_message(&message)));
                            match delivered {
                                Ok(true) => {}
                                Ok(false) => flag.store(false, Ordering::SeqCst),
                                Err(payload) => error!(
                                    message_kind = ?message.kind(),
                                    "message sink panicked: {}",
                                    panic_message(payload.as_ref())
                                ),
                            }
                        }
                        Envelope::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            keep_running,
        })
    }
}

impl MessageBus for QueuedMessageBus {
    fn publish(&self, message: RunnerMessage) -> bool {
        if let Some(sender) = &self.sender {
            if sender.send(Envelope::Message(message)).is_err() {
                warn!("message bus dispatcher is gone; dropping message");
                return false;
            }
        }
        self.keep_running.load(Ordering::SeqCst)
    }

    fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack, done) = mpsc::channel();
        if sender.send(Envelope::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl Drop for QueuedMessageBus {
    fn drop(&mut self) {
        // Closing the channel lets the dispatcher drain what is queued and exit.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("message bus dispatcher thread panicked");
            }
        }
    }
}

type StopPredicate = Box<dyn Fn(&RunnerMessage) -> bool + Send + Sync>;

/// Records every message it receives, in delivery order.
#[derive(Default)]
pub struct MessageRecorder {
    messages: Mutex<Vec<RunnerMessage>>,
    stop_when: Option<StopPredicate>,
}

impl MessageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers "stop" for every message matching `predicate` (and records it
    /// regardless).
    pub fn stop_when(
        mut self,
        predicate: impl Fn(&RunnerMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stop_when = Some(Box::new(predicate));
        self
    }

    /// A snapshot of everything recorded so far.
    pub fn messages(&self) -> Vec<RunnerMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded messages of the given kind.
    pub fn of_kind(&self, kind: MessageKind) -> Vec<RunnerMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.kind() == kind)
            .collect()
    }
}

impl MessageSink for MessageRecorder {
    fn on_message(&self, message: &RunnerMessage) -> bool {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        !self
            .stop_when
            .as_ref()
            .is_some_and(|predicate| predicate(message))
    }
}

/// Forwards to an inner sink and asks the run to stop once a test failed.
pub struct StopOnFailSink {
    inner: Arc<dyn MessageSink>,
    failed: AtomicBool,
}

impl StopOnFailSink {
    pub fn new(inner: Arc<dyn MessageSink>) -> Self {
        Self {
            inner,
            failed: AtomicBool::new(false),
        }
    }
}

impl MessageSink for StopOnFailSink {
    fn on_message(&self, message: &RunnerMessage) -> bool {
        let keep_running = self.inner.on_message(message);
        if message.kind() == MessageKind::Failed {
            self.failed.store(true, Ordering::SeqCst);
        }
        keep_running && !self.failed.load(Ordering::SeqCst)
    }
}
