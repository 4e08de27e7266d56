//! # Execution Pipeline Integration Tests / 执行管线集成测试
//!
//! This module drives complete runs through all six levels and checks the
//! published event stream: nesting, summaries, grouping and ordering.
//!
//! 此模块通过全部六个层级驱动完整运行，并检查发布的事件流：
//! 嵌套结构、摘要、分组和排序。

mod common;

use common::*;
use std::sync::Arc;

use test_conductor::messages::{MessageBody, MessageKind};
use test_conductor::models::{DataRow, Arg, TestAssembly, TestCase, TestCollection, TestClass};
use test_conductor::planner::Orderer;
use test_conductor::RunSummary;

struct ReverseOrderer;

impl<T> Orderer<T> for ReverseOrderer {
    fn name(&self) -> &str {
        "reverse"
    }

    fn order(&self, mut items: Vec<Arc<T>>) -> anyhow::Result<Vec<Arc<T>>> {
        items.reverse();
        Ok(items)
    }
}

struct PanickingOrderer;

impl Orderer<TestCollection> for PanickingOrderer {
    fn name(&self) -> &str {
        "panicking"
    }

    fn order(&self, _items: Vec<Arc<TestCollection>>) -> anyhow::Result<Vec<Arc<TestCollection>>> {
        panic!("orderer exploded");
    }
}

struct DroppingOrderer;

impl Orderer<TestClass> for DroppingOrderer {
    fn name(&self) -> &str {
        "dropping"
    }

    fn order(&self, mut items: Vec<Arc<TestClass>>) -> anyhow::Result<Vec<Arc<TestClass>>> {
        items.pop();
        Ok(items)
    }
}

#[cfg(test)]
mod event_stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_passing_test_produces_nested_events() {
        let asm = assembly("asm");
        let cases = simple_cases(&asm, "c1", 1);

        let (summary, recorder) = run(sync_config(), asm, cases).await;

        assert_eq!(
            labels(&recorder.messages()),
            vec![
                "AssemblyStarting",
                "CollectionStarting",
                "ClassStarting",
                "MethodStarting",
                "CaseStarting",
                "TestStarting",
                "TestPassed",
                "TestFinished",
                "CaseFinished",
                "MethodFinished",
                "ClassFinished",
                "CollectionFinished",
                "AssemblyFinished",
            ]
        );
        assert_eq!(summary.total, 1);
        assert_eq!(summary.passed(), 1);
    }

    #[tokio::test]
    async fn test_messages_carry_ancestor_ids() {
        let asm = assembly("asm");
        let cases = simple_cases(&asm, "c1", 1);
        let case_id = cases[0].unique_id.clone();

        let (_, recorder) = run(sync_config(), asm, cases).await;

        let passed = recorder.of_kind(MessageKind::Passed);
        assert_eq!(passed.len(), 1);
        let ids = &passed[0].ids;
        assert_eq!(ids.assembly, "asm");
        assert_eq!(ids.collection.as_deref(), Some("c1"));
        assert_eq!(ids.class.as_deref(), Some("c1.Class"));
        assert_eq!(ids.case.as_deref(), Some(case_id.as_str()));
        assert_eq!(ids.test.as_deref(), Some(format!("{case_id}[0]").as_str()));
    }

    #[tokio::test]
    async fn test_every_test_reports_exactly_one_outcome() {
        let asm = assembly("asm");
        let coll = collection(&asm, "c1");
        let cls = class(&coll, "Class");
        let cases = vec![
            case(&method(&cls, "a_pass", passing())),
            case(&method(&cls, "b_fail", failing("boom"))),
            Arc::new(TestCase::new("c_skip#case", "c_skip", &method(&cls, "c_skip", passing())).skip("not today")),
            Arc::new(TestCase::new("d_explicit#case", "d_explicit", &method(&cls, "d_explicit", passing())).explicit()),
        ];

        let (summary, recorder) = run(sync_config(), asm, cases).await;
        let messages = recorder.messages();

        for (id, expected) in [
            ("a_pass#case[0]", "TestPassed"),
            ("b_fail#case[0]", "TestFailed"),
            ("c_skip#case[0]", "TestSkipped"),
            ("d_explicit#case[0]", "TestNotRun"),
        ] {
            let outcomes: Vec<String> = for_test(&messages, id)
                .into_iter()
                .filter(|m| {
                    matches!(
                        m.kind(),
                        MessageKind::Passed
                            | MessageKind::Failed
                            | MessageKind::Skipped
                            | MessageKind::NotRun
                    )
                })
                .map(|m| label(m))
                .collect();
            assert_eq!(outcomes, vec![expected.to_string()], "outcomes of {id}");
        }

        assert_eq!(
            summary,
            RunSummary {
                total: 4,
                failed: 1,
                skipped: 1,
                not_run: 1,
                time: summary.time,
            }
        );
        assert_eq!(summary.passed(), 1);
    }

    #[tokio::test]
    async fn test_summaries_bubble_up_by_addition() {
        let asm = assembly("asm");
        let mut cases = simple_cases(&asm, "c1", 2);
        cases.extend(simple_cases(&asm, "c2", 3));
        let coll = collection(&asm, "c3");
        let cls = class(&coll, "c3.Class");
        cases.push(case(&method(&cls, "c3.Class.fails", failing("nope"))));

        let (summary, recorder) = run(sync_config(), asm, cases).await;

        let collection_summaries: Vec<RunSummary> = recorder
            .messages()
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::CollectionFinished { summary } => Some(*summary),
                _ => None,
            })
            .collect();
        assert_eq!(collection_summaries.len(), 3);
        let total: usize = collection_summaries.iter().map(|s| s.total).sum();
        let failed: usize = collection_summaries.iter().map(|s| s.failed).sum();
        assert_eq!(summary.total, total);
        assert_eq!(summary.failed, failed);
        assert_eq!((summary.total, summary.failed), (6, 1));
    }

    #[tokio::test]
    async fn test_assembly_finished_summary_matches_return_value() {
        let asm = assembly("asm");
        let cases = simple_cases(&asm, "c1", 3);

        let (summary, recorder) = run(sync_config(), asm, cases).await;

        let finished = recorder
            .messages()
            .into_iter()
            .find_map(|m| match m.body {
                MessageBody::AssemblyFinished { summary } => Some(summary),
                _ => None,
            })
            .expect("AssemblyFinished must be published");
        assert_eq!(finished, summary);
    }

    #[tokio::test]
    async fn test_queued_bus_delivers_the_same_stream() {
        let asm = assembly("asm");
        let cases = simple_cases(&asm, "c1", 2);

        let (_, recorder) = run(test_conductor::RunnerConfig::default(), asm, cases).await;

        let messages = recorder.messages();
        assert_eq!(label(&messages[0]), "AssemblyStarting");
        assert_eq!(label(messages.last().unwrap()), "AssemblyFinished");
        assert_eq!(recorder.of_kind(MessageKind::Passed).len(), 2);
    }

    #[tokio::test]
    async fn test_cases_of_other_assemblies_are_ignored() {
        let asm = assembly("asm");
        let other = assembly("other");
        let mut cases = simple_cases(&asm, "c1", 1);
        cases.extend(simple_cases(&other, "c9", 2));

        let (summary, _) = run(sync_config(), asm, cases).await;

        assert_eq!(summary.total, 1);
    }
}

#[cfg(test)]
mod data_driven_tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_expand_into_individual_tests() {
        let asm = assembly("asm");
        let coll = collection(&asm, "c1");
        let cls = class(&coll, "Math");
        let adds = Arc::new(
            test_conductor::models::TestMethod::new("Math.adds", "adds", &cls, |inv: test_conductor::invocation::Invocation| async move {
                let a = *inv.arg::<i32>(0)?;
                let b = *inv.arg::<i32>(1)?;
                let sum = *inv.arg::<i32>(2)?;
                anyhow::ensure!(a + b == sum, "{a} + {b} != {sum}");
                anyhow::Ok(())
            })
            .with_parameters(["a", "b", "sum"]),
        );
        let case = Arc::new(TestCase::new("Math.adds#rows", "Math.adds", &adds).with_rows(vec![
            DataRow::new(vec![Arg::new(1), Arg::new(2), Arg::new(3)]),
            DataRow::new(vec![Arg::new(2), Arg::new(2), Arg::new(5)]),
            DataRow::new(vec![Arg::new(0), Arg::new(0), Arg::new(0)]).skipped("zero"),
        ]));

        let (summary, recorder) = run(sync_config(), asm, vec![case]).await;

        assert_eq!((summary.total, summary.failed, summary.skipped), (3, 1, 1));
        let names: Vec<String> = recorder
            .messages()
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::TestStarting { display_name, .. } => Some(display_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "Math.adds(a: 1, b: 2, sum: 3)",
                "Math.adds(a: 2, b: 2, sum: 5)",
                "Math.adds(a: 0, b: 0, sum: 0)",
            ]
        );
        assert_eq!(failure_messages(&recorder.messages()), vec!["2 + 2 != 5"]);
    }

    #[tokio::test]
    async fn test_empty_data_source_fails_the_case() {
        let asm = assembly("asm");
        let coll = collection(&asm, "c1");
        let cls = class(&coll, "Data");
        let m = method(&cls, "Data.none", passing());
        let case = Arc::new(
            TestCase::new("Data.none#rows", "Data.none", &m)
                .with_data_source(|| anyhow::Ok(Vec::<DataRow>::new())),
        );

        let (summary, recorder) = run(sync_config(), asm, vec![case]).await;

        assert_eq!((summary.total, summary.failed), (1, 1));
        let failures = failure_messages(&recorder.messages());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("No data found"), "{}", failures[0]);
    }
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    fn collection_start_order(messages: &[test_conductor::RunnerMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::CollectionStarting { .. } => m.ids.collection.clone(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_default_order_is_by_unique_id() {
        let asm = assembly("asm");
        let mut cases = simple_cases(&asm, "zeta", 1);
        cases.extend(simple_cases(&asm, "alpha", 1));
        cases.extend(simple_cases(&asm, "mid", 1));
        let config = test_conductor::RunnerConfig {
            disable_parallelization: true,
            ..sync_config()
        };

        let (_, recorder) = run(config, asm, cases).await;

        assert_eq!(
            collection_start_order(&recorder.messages()),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[tokio::test]
    async fn test_custom_collection_orderer_is_honored() {
        let asm = Arc::new(TestAssembly::new("asm", "asm.dll").with_collection_orderer(Arc::new(ReverseOrderer)));
        let mut cases = simple_cases(&asm, "a", 1);
        cases.extend(simple_cases(&asm, "b", 1));
        let config = test_conductor::RunnerConfig {
            disable_parallelization: true,
            ..sync_config()
        };

        let (_, recorder) = run(config, asm, cases).await;

        assert_eq!(collection_start_order(&recorder.messages()), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_case_orderer_decides_method_order() {
        let asm = assembly("asm");
        let coll = collection(&asm, "c1");
        let cls = Arc::new(TestClass::new("Class", "Class", &coll).with_case_orderer(Arc::new(ReverseOrderer)));
        let cases = vec![
            case(&method(&cls, "m1", passing())),
            case(&method(&cls, "m2", passing())),
            case(&method(&cls, "m3", passing())),
        ];

        let (_, recorder) = run(sync_config(), asm, cases).await;

        let methods: Vec<String> = recorder
            .messages()
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::MethodStarting { method_name, .. } => Some(method_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(methods, vec!["m3", "m2", "m1"]);
    }

    #[tokio::test]
    async fn test_panicking_orderer_falls_back_to_default_order() {
        let asm = Arc::new(TestAssembly::new("asm", "asm.dll").with_collection_orderer(Arc::new(PanickingOrderer)));
        let mut cases = simple_cases(&asm, "b", 1);
        cases.extend(simple_cases(&asm, "a", 1));
        let config = test_conductor::RunnerConfig {
            disable_parallelization: true,
            ..sync_config()
        };

        let (summary, recorder) = run(config, asm, cases).await;
        let messages = recorder.messages();

        let errors = recorder.of_kind(MessageKind::Error);
        assert_eq!(errors.len(), 1);
        let message = errors[0].body.error().and_then(|e| e.message()).unwrap_or_default().to_string();
        assert!(message.contains("panicking"), "{message}");
        assert!(message.contains("orderer exploded"), "{message}");
        assert_eq!(collection_start_order(&messages), vec!["a", "b"]);
        assert_eq!((summary.total, summary.failed), (2, 0));
    }

    #[tokio::test]
    async fn test_orderer_returning_a_subset_is_rejected() {
        let asm = Arc::new(TestAssembly::new("asm", "asm.dll").with_class_orderer(Arc::new(DroppingOrderer)));
        let coll = collection(&asm, "c1");
        let first = class(&coll, "First");
        let second = class(&coll, "Second");
        let cases = vec![
            case(&method(&first, "First.m", passing())),
            case(&method(&second, "Second.m", passing())),
        ];

        let (summary, recorder) = run(sync_config(), asm, cases).await;

        assert_eq!(recorder.of_kind(MessageKind::Error).len(), 1);
        assert_eq!(summary.total, 2);
    }
}
