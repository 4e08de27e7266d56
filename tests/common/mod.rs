// Shared test helpers for integration tests
#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_conductor::invocation::{BeforeAfterTestHook, Invocation, TestBody};
use test_conductor::messages::{MessageBody, RunnerMessage};
use test_conductor::models::{Test, TestAssembly, TestCase, TestClass, TestCollection, TestMethod};
use test_conductor::{MessageRecorder, RunSummary, RunnerConfig, TestExecutor};

/// A configuration that delivers messages on the publishing task, which keeps
/// assertions about ordering simple.
pub fn sync_config() -> RunnerConfig {
    RunnerConfig {
        synchronous_message_reporting: true,
        ..RunnerConfig::default()
    }
}

pub fn assembly(id: &str) -> Arc<TestAssembly> {
    Arc::new(TestAssembly::new(id, format!("{id}.dll")))
}

pub fn collection(assembly: &Arc<TestAssembly>, id: &str) -> Arc<TestCollection> {
    Arc::new(TestCollection::new(id, format!("Collection {id}"), assembly))
}

pub fn class(collection: &Arc<TestCollection>, id: &str) -> Arc<TestClass> {
    Arc::new(TestClass::new(id, id, collection))
}

pub fn method(class: &Arc<TestClass>, id: &str, body: impl TestBody + 'static) -> Arc<TestMethod> {
    Arc::new(TestMethod::new(id, id, class, body))
}

/// The single argument-less case of `method`.
pub fn case(method: &Arc<TestMethod>) -> Arc<TestCase> {
    Arc::new(TestCase::new(
        format!("{}#case", method.unique_id),
        method.name.clone(),
        method,
    ))
}

pub fn passing() -> impl TestBody {
    |_: Invocation| async { anyhow::Ok(()) }
}

pub fn failing(message: &'static str) -> impl TestBody {
    move |_: Invocation| async move { Err::<(), _>(anyhow::anyhow!(message)) }
}

pub fn sleeping(duration: Duration) -> impl TestBody {
    move |_: Invocation| async move {
        tokio::time::sleep(duration).await;
        anyhow::Ok(())
    }
}

/// `count` passing cases in one class of one collection.
pub fn simple_cases(assembly: &Arc<TestAssembly>, collection_id: &str, count: usize) -> Vec<Arc<TestCase>> {
    let collection = collection(assembly, collection_id);
    let class = class(&collection, &format!("{collection_id}.Class"));
    (0..count)
        .map(|i| case(&method(&class, &format!("{collection_id}.Class.m{i:02}"), passing())))
        .collect()
}

/// Runs `cases` and returns the summary together with every recorded message.
pub async fn run(
    config: RunnerConfig,
    assembly: Arc<TestAssembly>,
    cases: Vec<Arc<TestCase>>,
) -> (RunSummary, Arc<MessageRecorder>) {
    let recorder = Arc::new(MessageRecorder::new());
    let summary = TestExecutor::new(config, recorder.clone())
        .run(assembly, cases)
        .await;
    (summary, recorder)
}

/// The variant name of a message body, e.g. `TestPassed`.
pub fn label(message: &RunnerMessage) -> String {
    let debug = format!("{:?}", message.body);
    debug
        .split([' ', '{', '('])
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn labels(messages: &[RunnerMessage]) -> Vec<String> {
    messages.iter().map(label).collect()
}

/// Messages concerning the test with the given unique ID.
pub fn for_test<'a>(messages: &'a [RunnerMessage], test_id: &str) -> Vec<&'a RunnerMessage> {
    messages
        .iter()
        .filter(|m| m.ids.test.as_deref() == Some(test_id))
        .collect()
}

/// Asserts that every `<Level>Starting` has exactly one `<Level>Finished`.
pub fn assert_balanced(messages: &[RunnerMessage]) {
    let labels = labels(messages);
    let count = |l: &str| labels.iter().filter(|x| x.as_str() == l).count();
    for level in ["Assembly", "Collection", "Class", "Method", "Case", "Test"] {
        let start = format!("{level}Starting");
        let finish = format!("{level}Finished");
        assert_eq!(count(&start), count(&finish), "{start}/{finish}");
    }
}

pub fn failure_messages(messages: &[RunnerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::TestFailed { error, .. } => error.message().map(str::to_string),
            _ => None,
        })
        .collect()
}

/// A shared, ordered log of things that happened during a run.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// A before/after hook that records its calls and can fail its `before`.
pub struct RecordingHook {
    pub name: String,
    pub journal: Journal,
    pub fail_before: bool,
}

impl RecordingHook {
    pub fn new(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
            fail_before: false,
        })
    }

    pub fn failing(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
            fail_before: true,
        })
    }
}

impl BeforeAfterTestHook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn before<'a>(&'a self, _test: &'a Test) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.journal.record(format!("before {}", self.name));
            if self.fail_before {
                anyhow::bail!("before hook {} failed", self.name);
            }
            Ok(())
        }
        .boxed()
    }

    fn after<'a>(&'a self, _test: &'a Test) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.journal.record(format!("after {}", self.name));
            Ok(())
        }
        .boxed()
    }
}
