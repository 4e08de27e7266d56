//! # Data Models Module / 数据模型模块
//!
//! This module defines the hierarchy the engine drives: assembly, collection,
//! class, method, case and concrete test. Entities are produced by a discovery
//! collaborator; the engine only groups, orders and schedules them. Parent
//! references point up the tree through `Arc`s, while the run itself owns the
//! list of cases and therefore the lifetime of everything below the assembly.
//!
//! 此模块定义了引擎驱动的层级结构：程序集、集合、类、方法、用例和具体测试。
//! 实体由发现协作者产生；引擎只负责分组、排序和调度。

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ExplicitOption;
use crate::core::fixtures::FixtureDefinition;
use crate::core::invocation::{BeforeAfterTestHook, TestBody};
use crate::core::planner::Orderer;

/// Trait tags attached to an entity: name → values.
pub type Traits = BTreeMap<String, Vec<String>>;

/// Anything with a stable unique identity assigned at discovery.
pub trait Identified {
    fn unique_id(&self) -> &str;
}

/// Where a test case was declared. Used only for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Aggregated outcome counts of a level.
///
/// `passed` is implicit: `total - failed - skipped - not_run`.
/// 层级的聚合结果计数。通过数是隐式的。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of tests reported / 报告的测试数
    pub total: usize,
    /// Number of failed tests / 失败的测试数
    pub failed: usize,
    /// Number of skipped tests / 跳过的测试数
    pub skipped: usize,
    /// Number of tests excluded by the explicit option / 因显式选项而未运行的测试数
    pub not_run: usize,
    /// Elapsed time / 耗时
    pub time: Duration,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.total
            .saturating_sub(self.failed + self.skipped + self.not_run)
    }

    /// The summary of a single passed test.
    pub fn passed_test(time: Duration) -> Self {
        Self {
            total: 1,
            time,
            ..Self::default()
        }
    }

    pub fn failed_test(time: Duration) -> Self {
        Self {
            total: 1,
            failed: 1,
            time,
            ..Self::default()
        }
    }

    pub fn skipped_test() -> Self {
        Self {
            total: 1,
            skipped: 1,
            ..Self::default()
        }
    }

    pub fn not_run_test() -> Self {
        Self {
            total: 1,
            not_run: 1,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.not_run += other.not_run;
        self.time += other.time;
    }
}

impl Add for RunSummary {
    type Output = RunSummary;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl std::iter::Sum for RunSummary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(RunSummary::default(), Add::add)
    }
}

/// The root of the hierarchy: one test binary / project.
pub struct TestAssembly {
    pub unique_id: String,
    pub name: String,
    /// Assembly-scoped fixtures, constructed when the assembly starts.
    pub fixtures: Vec<Arc<FixtureDefinition>>,
    pub hooks: Vec<Arc<dyn BeforeAfterTestHook>>,
    pub collection_orderer: Option<Arc<dyn Orderer<TestCollection>>>,
    pub class_orderer: Option<Arc<dyn Orderer<TestClass>>>,
    pub method_orderer: Option<Arc<dyn Orderer<TestMethod>>>,
    pub case_orderer: Option<Arc<dyn Orderer<TestCase>>>,
    pub traits: Traits,
}

impl TestAssembly {
    pub fn new(unique_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            name: name.into(),
            fixtures: Vec::new(),
            hooks: Vec::new(),
            collection_orderer: None,
            class_orderer: None,
            method_orderer: None,
            case_orderer: None,
            traits: Traits::new(),
        }
    }

    pub fn with_fixture(mut self, fixture: Arc<FixtureDefinition>) -> Self {
        self.fixtures.push(fixture);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BeforeAfterTestHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_collection_orderer(mut self, orderer: Arc<dyn Orderer<TestCollection>>) -> Self {
        self.collection_orderer = Some(orderer);
        self
    }

    pub fn with_class_orderer(mut self, orderer: Arc<dyn Orderer<TestClass>>) -> Self {
        self.class_orderer = Some(orderer);
        self
    }

    pub fn with_method_orderer(mut self, orderer: Arc<dyn Orderer<TestMethod>>) -> Self {
        self.method_orderer = Some(orderer);
        self
    }

    pub fn with_case_orderer(mut self, orderer: Arc<dyn Orderer<TestCase>>) -> Self {
        self.case_orderer = Some(orderer);
        self
    }
}

/// The unit of parallelism: collections may run concurrently with each other;
/// everything inside one collection runs serially.
pub struct TestCollection {
    pub unique_id: String,
    pub display_name: String,
    pub assembly: Arc<TestAssembly>,
    /// Routes this collection to the serial phase regardless of the
    /// run-wide setting.
    pub disable_parallelization: bool,
    /// Collection-scoped fixtures.
    pub fixtures: Vec<Arc<FixtureDefinition>>,
    pub case_orderer: Option<Arc<dyn Orderer<TestCase>>>,
    pub traits: Traits,
}

impl TestCollection {
    pub fn new(
        unique_id: impl Into<String>,
        display_name: impl Into<String>,
        assembly: &Arc<TestAssembly>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            display_name: display_name.into(),
            assembly: assembly.clone(),
            disable_parallelization: false,
            fixtures: Vec::new(),
            case_orderer: None,
            traits: Traits::new(),
        }
    }

    pub fn serial(mut self) -> Self {
        self.disable_parallelization = true;
        self
    }

    pub fn with_fixture(mut self, fixture: Arc<FixtureDefinition>) -> Self {
        self.fixtures.push(fixture);
        self
    }

    pub fn with_case_orderer(mut self, orderer: Arc<dyn Orderer<TestCase>>) -> Self {
        self.case_orderer = Some(orderer);
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.entry(name.into()).or_default().push(value.into());
        self
    }
}

pub struct TestClass {
    pub unique_id: String,
    pub name: String,
    pub collection: Arc<TestCollection>,
    /// How to construct an instance per test. `None` for a static class, in
    /// which case tests receive no instance.
    pub factory: Option<Arc<FixtureDefinition>>,
    /// Class-scoped fixtures.
    pub fixtures: Vec<Arc<FixtureDefinition>>,
    pub hooks: Vec<Arc<dyn BeforeAfterTestHook>>,
    pub case_orderer: Option<Arc<dyn Orderer<TestCase>>>,
    pub traits: Traits,
}

impl TestClass {
    pub fn new(
        unique_id: impl Into<String>,
        name: impl Into<String>,
        collection: &Arc<TestCollection>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            name: name.into(),
            collection: collection.clone(),
            factory: None,
            fixtures: Vec::new(),
            hooks: Vec::new(),
            case_orderer: None,
            traits: Traits::new(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<FixtureDefinition>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_fixture(mut self, fixture: Arc<FixtureDefinition>) -> Self {
        self.fixtures.push(fixture);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BeforeAfterTestHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_case_orderer(mut self, orderer: Arc<dyn Orderer<TestCase>>) -> Self {
        self.case_orderer = Some(orderer);
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.entry(name.into()).or_default().push(value.into());
        self
    }
}

pub struct TestMethod {
    pub unique_id: String,
    pub name: String,
    pub class: Arc<TestClass>,
    /// Parameter names, used to render display names of data rows.
    pub parameters: Vec<String>,
    pub body: Arc<dyn TestBody>,
    pub hooks: Vec<Arc<dyn BeforeAfterTestHook>>,
    pub traits: Traits,
}

impl TestMethod {
    pub fn new(
        unique_id: impl Into<String>,
        name: impl Into<String>,
        class: &Arc<TestClass>,
        body: impl TestBody + 'static,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            name: name.into(),
            class: class.clone(),
            parameters: Vec::new(),
            body: Arc::new(body),
            hooks: Vec::new(),
            traits: Traits::new(),
        }
    }

    pub fn with_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BeforeAfterTestHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.entry(name.into()).or_default().push(value.into());
        self
    }
}

/// A boolean predicate deciding a dynamic skip, evaluated once per test.
#[derive(Clone)]
pub struct SkipCondition {
    /// Name of the checked property, used in error messages.
    pub name: String,
    pub predicate: Arc<dyn Fn() -> anyhow::Result<bool> + Send + Sync>,
}

impl SkipCondition {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for SkipCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A resolved argument value of a data row.
#[derive(Clone)]
pub struct Arg {
    pub value: Arc<dyn Any + Send + Sync>,
    /// Rendered form used in display names.
    pub display: String,
}

impl Arg {
    pub fn new<T: fmt::Debug + Send + Sync + 'static>(value: T) -> Self {
        let display = format!("{value:?}");
        Self {
            value: Arc::new(value),
            display,
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// One row of a data-driven case.
#[derive(Debug, Clone, Default)]
pub struct DataRow {
    pub args: Vec<Arg>,
    /// Replaces the generated display name.
    pub label: Option<String>,
    /// Statically skips only this row.
    pub skip: Option<String>,
    /// Overrides the case's explicit flag for this row.
    pub explicit: Option<bool>,
    pub traits: Traits,
}

impl DataRow {
    pub fn new(args: Vec<Arg>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    pub fn explicit(mut self, explicit: bool) -> Self {
        self.explicit = Some(explicit);
        self
    }
}

/// Produces data rows at run time.
pub trait DataSource: Send + Sync {
    fn rows(&self) -> BoxFuture<'_, anyhow::Result<Vec<DataRow>>>;
}

impl<F> DataSource for F
where
    F: Fn() -> anyhow::Result<Vec<DataRow>> + Send + Sync,
{
    fn rows(&self) -> BoxFuture<'_, anyhow::Result<Vec<DataRow>>> {
        future::ready(self()).boxed()
    }
}

/// How a case expands into concrete tests.
#[derive(Clone, Default)]
pub enum CaseData {
    /// Exactly one test without arguments.
    #[default]
    Single,
    /// One test per row, known at discovery time.
    Rows(Vec<DataRow>),
    /// Rows produced when the case starts.
    Deferred(Arc<dyn DataSource>),
}

impl fmt::Debug for CaseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseData::Single => f.write_str("Single"),
            CaseData::Rows(rows) => f.debug_tuple("Rows").field(&rows.len()).finish(),
            CaseData::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// A declared unit of testing that expands into one or more [`Test`]s.
pub struct TestCase {
    pub unique_id: String,
    pub display_name: String,
    pub method: Arc<TestMethod>,
    pub traits: Traits,
    pub source: Option<SourceLocation>,
    /// Static skip reason. When a skip condition is set, this is the reason
    /// reported if the condition fires instead.
    pub skip_reason: Option<String>,
    pub skip_when: Option<SkipCondition>,
    pub skip_unless: Option<SkipCondition>,
    pub explicit: bool,
    /// Per-test timeout; `None` or zero disables it.
    pub timeout: Option<Duration>,
    pub data: CaseData,
}

impl TestCase {
    pub fn new(
        unique_id: impl Into<String>,
        display_name: impl Into<String>,
        method: &Arc<TestMethod>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            display_name: display_name.into(),
            method: method.clone(),
            traits: Traits::new(),
            source: None,
            skip_reason: None,
            skip_when: None,
            skip_unless: None,
            explicit: false,
            timeout: None,
            data: CaseData::Single,
        }
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn skip_when(mut self, condition: SkipCondition) -> Self {
        self.skip_when = Some(condition);
        self
    }

    pub fn skip_unless(mut self, condition: SkipCondition) -> Self {
        self.skip_unless = Some(condition);
        self
    }

    pub fn explicit(mut self) -> Self {
        self.explicit = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rows(mut self, rows: Vec<DataRow>) -> Self {
        self.data = CaseData::Rows(rows);
        self
    }

    pub fn with_data_source(mut self, source: impl DataSource + 'static) -> Self {
        self.data = CaseData::Deferred(Arc::new(source));
        self
    }

    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourceLocation {
            file: file.into(),
            line,
        });
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn class(&self) -> &Arc<TestClass> {
        &self.method.class
    }

    pub fn collection(&self) -> &Arc<TestCollection> {
        &self.method.class.collection
    }

    /// True when a skip condition decides the skip at run time.
    pub fn has_skip_condition(&self) -> bool {
        self.skip_when.is_some() || self.skip_unless.is_some()
    }

    /// The skip reason that applies without running anything.
    pub fn static_skip_reason(&self) -> Option<&str> {
        if self.has_skip_condition() {
            None
        } else {
            self.skip_reason.as_deref()
        }
    }

    /// Whether any test of this case could execute under `option`. Used to
    /// avoid constructing fixtures for classes whose tests will all be
    /// skipped or excluded.
    pub fn may_run(&self, option: ExplicitOption) -> bool {
        if self.static_skip_reason().is_some() {
            return false;
        }
        match &self.data {
            CaseData::Rows(rows) => rows.iter().any(|row| {
                row.skip.is_none() && option.includes(row.explicit.unwrap_or(self.explicit))
            }),
            CaseData::Single => option.includes(self.explicit),
            // Rows may override the explicit flag; unknown until expanded.
            CaseData::Deferred(_) => true,
        }
    }

    /// Expands this case into its concrete tests.
    ///
    /// Test IDs are `<case id>[<index>]`. An empty row set is an error.
    pub async fn tests(self: &Arc<Self>) -> anyhow::Result<Vec<Test>> {
        let rows = match &self.data {
            CaseData::Single => return Ok(vec![Test::synthetic(self)]),
            CaseData::Rows(rows) => rows.clone(),
            CaseData::Deferred(source) => source.rows().await?,
        };
        if rows.is_empty() {
            anyhow::bail!(
                "No data found for {}. A data-driven case must produce at least one row.",
                self.display_name
            );
        }
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| Test::from_row(self, index, row))
            .collect())
    }
}

/// One concrete, individually reportable execution.
#[derive(Debug, Clone)]
pub struct Test {
    pub unique_id: String,
    pub display_name: String,
    pub case: Arc<TestCase>,
    pub index: usize,
    pub args: Vec<Arg>,
    pub traits: Traits,
    pub explicit: bool,
    pub skip_reason: Option<String>,
    pub timeout: Option<Duration>,
}

impl Test {
    /// The single argument-less test of a case. Also used to report a case
    /// that could not be expanded.
    pub fn synthetic(case: &Arc<TestCase>) -> Self {
        Self {
            unique_id: format!("{}[0]", case.unique_id),
            display_name: case.display_name.clone(),
            case: case.clone(),
            index: 0,
            args: Vec::new(),
            traits: case.traits.clone(),
            explicit: case.explicit,
            skip_reason: case.static_skip_reason().map(str::to_string),
            timeout: case.timeout.filter(|t| !t.is_zero()),
        }
    }

    fn from_row(case: &Arc<TestCase>, index: usize, row: DataRow) -> Self {
        let display_name = match row.label {
            Some(label) => label,
            None if row.args.is_empty() => case.display_name.clone(),
            None => {
                let rendered: Vec<String> = row
                    .args
                    .iter()
                    .enumerate()
                    .map(|(i, arg)| match case.method.parameters.get(i) {
                        Some(name) => format!("{name}: {}", arg.display),
                        None => format!("arg{i}: {}", arg.display),
                    })
                    .collect();
                format!("{}({})", case.display_name, rendered.join(", "))
            }
        };
        let mut traits = case.traits.clone();
        for (name, values) in row.traits {
            traits.entry(name).or_default().extend(values);
        }
        Self {
            unique_id: format!("{}[{index}]", case.unique_id),
            display_name,
            case: case.clone(),
            index,
            args: row.args,
            traits,
            explicit: row.explicit.unwrap_or(case.explicit),
            skip_reason: row.skip.or_else(|| case.static_skip_reason().map(str::to_string)),
            timeout: case.timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn method(&self) -> &Arc<TestMethod> {
        &self.case.method
    }
}

macro_rules! identified {
    ($($ty:ty),*) => {
        $(impl Identified for $ty {
            fn unique_id(&self) -> &str {
                &self.unique_id
            }
        })*
    };
}

identified!(TestAssembly, TestCollection, TestClass, TestMethod, TestCase, Test);

macro_rules! opaque_debug {
    ($ty:ty, $name:literal, $label:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($name)
                    .field("unique_id", &self.unique_id)
                    .field(stringify!($label), &self.$label)
                    .finish_non_exhaustive()
            }
        }
    };
}

opaque_debug!(TestAssembly, "TestAssembly", name);
opaque_debug!(TestCollection, "TestCollection", display_name);
opaque_debug!(TestClass, "TestClass", name);
opaque_debug!(TestMethod, "TestMethod", name);
opaque_debug!(TestCase, "TestCase", display_name);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::invocation::Invocation;

    fn method(parameters: &[&str]) -> Arc<TestMethod> {
        let assembly = Arc::new(TestAssembly::new("asm", "asm"));
        let collection = Arc::new(TestCollection::new("col", "col", &assembly));
        let class = Arc::new(TestClass::new("cls", "Cls", &collection));
        Arc::new(
            TestMethod::new("m", "adds", &class, |_: Invocation| async { Ok(()) })
                .with_parameters(parameters.iter().copied()),
        )
    }

    #[test]
    fn summary_addition_is_field_wise() {
        let total = RunSummary::passed_test(Duration::from_millis(5))
            + RunSummary::failed_test(Duration::from_millis(7))
            + RunSummary::skipped_test()
            + RunSummary::not_run_test();
        assert_eq!(total.total, 4);
        assert_eq!(total.passed(), 1);
        assert_eq!(total.time, Duration::from_millis(12));
    }

    #[tokio::test]
    async fn rows_expand_with_parameter_names() {
        let case = Arc::new(TestCase::new("case", "adds", &method(&["a", "b"])).with_rows(vec![
            DataRow::new(vec![Arg::new(1), Arg::new(2)]),
            DataRow::new(vec![Arg::new(3)]).labeled("three"),
        ]));
        let tests = case.tests().await.unwrap();
        assert_eq!(tests[0].unique_id, "case[0]");
        assert_eq!(tests[0].display_name, "adds(a: 1, b: 2)");
        assert_eq!(tests[1].display_name, "three");
    }

    #[tokio::test]
    async fn empty_data_is_an_error() {
        let case = Arc::new(TestCase::new("case", "adds", &method(&[])).with_rows(vec![]));
        assert!(case.tests().await.is_err());
    }

    #[test]
    fn conditional_skip_is_not_static() {
        let case = TestCase::new("case", "c", &method(&[]))
            .skip("only on CI")
            .skip_unless(SkipCondition::new("on_ci", || Ok(false)));
        assert_eq!(case.static_skip_reason(), None);
        assert!(case.may_run(ExplicitOption::Off));
    }
}
