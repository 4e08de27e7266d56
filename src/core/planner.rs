//! # Execution Planner Module / 执行计划模块
//!
//! Grouping and ordering of test cases at each level. Grouping is stable and
//! deterministic: groups come out in ascending unique-ID order and items keep
//! their relative order inside a group. Custom [`Orderer`]s may reorder
//! collections, classes, methods and test cases; a misbehaving orderer is
//! reported and the default order is used instead, so the run always goes on.
//!
//! 各层级测试用例的分组和排序。分组是稳定且确定的；
//! 自定义排序器出错时会被报告，并回退到默认顺序。

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::core::execution::context::LevelContext;
use crate::core::failure::Failure;
use crate::core::messages::MessageBody;
use crate::core::models::Identified;

/// A custom ordering collaborator.
pub trait Orderer<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `items` in the desired order. The result must be a permutation
    /// of the input.
    fn order(&self, items: Vec<Arc<T>>) -> anyhow::Result<Vec<Arc<T>>>;
}

/// Groups `items` by the entity `key` returns, in ascending unique-ID order of
/// the keys.
pub fn group_by<K, T, F>(items: &[Arc<T>], key: F) -> Vec<(Arc<K>, Vec<Arc<T>>)>
where
    K: Identified,
    F: Fn(&T) -> &Arc<K>,
{
    let mut groups: BTreeMap<String, (Arc<K>, Vec<Arc<T>>)> = BTreeMap::new();
    for item in items {
        let owner = key(item);
        groups
            .entry(owner.unique_id().to_string())
            .or_insert_with(|| (owner.clone(), Vec::new()))
            .1
            .push(item.clone());
    }
    groups.into_values().collect()
}

/// Groups `items` by the entity `key` returns, keeping groups in the order
/// their first item appears. Used after a custom orderer has run.
pub fn group_in_order<K, T, F>(items: &[Arc<T>], key: F) -> Vec<(Arc<K>, Vec<Arc<T>>)>
where
    K: Identified,
    F: Fn(&T) -> &Arc<K>,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Arc<K>, Vec<Arc<T>>)> = Vec::new();
    for item in items {
        let owner = key(item);
        let index = *positions
            .entry(owner.unique_id().to_string())
            .or_insert_with(|| {
                groups.push((owner.clone(), Vec::new()));
                groups.len() - 1
            });
        groups[index].1.push(item.clone());
    }
    groups
}

/// Sorts by unique ID, keeping equal IDs in input order.
pub fn default_order<T: Identified>(mut items: Vec<Arc<T>>) -> Vec<Arc<T>> {
    items.sort_by(|a, b| a.unique_id().cmp(b.unique_id()));
    items
}

/// Orders `items` with `orderer`, falling back to [`default_order`] when there
/// is no orderer or it fails. Failures are published as `Error` messages.
pub(crate) fn order<T: Identified>(
    ctx: &mut LevelContext,
    what: &str,
    orderer: Option<&Arc<dyn Orderer<T>>>,
    items: Vec<Arc<T>>,
) -> Vec<Arc<T>> {
    let Some(orderer) = orderer else {
        return default_order(items);
    };
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| orderer.order(items.clone())));
    let failure = match attempt {
        Ok(Ok(ordered)) if is_permutation(&items, &ordered) => return ordered,
        Ok(Ok(_)) => Failure::new(
            "OrdererError",
            format!(
                "{what} orderer '{}' did not return a permutation of its input",
                orderer.name()
            ),
        ),
        Ok(Err(error)) => annotate(Failure::from(error), what, orderer.name()),
        Err(payload) => annotate(Failure::from_panic(payload), what, orderer.name()),
    };
    warn!(orderer = orderer.name(), "{failure}; using default order");
    ctx.publish(MessageBody::Error {
        error: failure.flatten(),
    });
    default_order(items)
}

/// Orders already-built groups by their keys.
pub(crate) fn order_groups<K: Identified, T>(
    ctx: &mut LevelContext,
    what: &str,
    orderer: Option<&Arc<dyn Orderer<K>>>,
    groups: Vec<(Arc<K>, Vec<Arc<T>>)>,
) -> Vec<(Arc<K>, Vec<Arc<T>>)> {
    if orderer.is_none() {
        return groups;
    }
    let keys: Vec<Arc<K>> = groups.iter().map(|(key, _)| key.clone()).collect();
    let mut by_id: HashMap<String, (Arc<K>, Vec<Arc<T>>)> = groups
        .into_iter()
        .map(|group| (group.0.unique_id().to_string(), group))
        .collect();
    order(ctx, what, orderer, keys)
        .into_iter()
        .filter_map(|key| by_id.remove(key.unique_id()))
        .collect()
}

fn annotate(mut failure: Failure, what: &str, name: &str) -> Failure {
    failure.message = format!("{what} orderer '{name}' failed: {}", failure.message);
    failure
}

fn is_permutation<T: Identified>(input: &[Arc<T>], output: &[Arc<T>]) -> bool {
    if input.len() != output.len() {
        return false;
    }
    let mut counts: HashMap<&str, isize> = HashMap::new();
    for item in input {
        *counts.entry(item.unique_id()).or_default() += 1;
    }
    for item in output {
        *counts.entry(item.unique_id()).or_default() -= 1;
    }
    counts.values().all(|count| *count == 0)
}
