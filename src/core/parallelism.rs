//! # Parallelism Module / 并行控制模块
//!
//! Decides the worker budget of a run and how parallel-eligible collections
//! are launched:
//!
//! - **Unlimited** (`max < 0`): every collection is spawned at once.
//! - **Conservative**: a collection holds one of `max` semaphore permits for
//!   its whole run. The runtime must have at least `min(4, max)` workers, or
//!   collections are spawned on an engine-owned runtime of that size.
//! - **Aggressive**: every collection is spawned at once, and a
//!   [`ContinuationGate`] of `max` permits wraps each unit of awaited work
//!   inside the collections (fixture hooks, instance construction and
//!   disposal, before/after hooks, test bodies). Tokio offers no way to
//!   intercept individual continuations, so the gate is placed around the
//!   units that would have been scheduled as continuations.
//!
//! Collections that opt out of parallelization run afterwards, one at a time.
//!
//! 决定运行的工作线程预算以及并行集合的启动方式。

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{ParallelAlgorithm, RunnerConfig};
use crate::core::failure::Failure;
use crate::core::models::RunSummary;

/// Minimum worker floor requested by the conservative algorithm.
const WORKER_FLOOR_CAP: usize = 4;

/// The resolved `maxParallelThreads` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadBudget {
    Unlimited,
    Limited(usize),
}

impl ThreadBudget {
    /// 0 resolves to the logical CPU count, a negative value to unlimited.
    pub fn resolve(requested: i32) -> Self {
        match requested {
            n if n < 0 => ThreadBudget::Unlimited,
            0 => ThreadBudget::Limited(num_cpus::get().max(1)),
            n => ThreadBudget::Limited(n as usize),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            ThreadBudget::Unlimited => None,
            ThreadBudget::Limited(n) => Some(*n),
        }
    }
}

/// Caps how many units of awaited work may run at once. Unbounded when the
/// aggressive algorithm is not in use.
#[derive(Debug, Clone, Default)]
pub struct ContinuationGate {
    permits: Option<Arc<Semaphore>>,
}

impl ContinuationGate {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(permits: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(permits.max(1)))),
        }
    }

    /// Runs `work` while holding a permit. Must not be nested inside another
    /// `run` on the same gate.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        let _permit = match &self.permits {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        work.await
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.permits.as_ref().map(|s| s.available_permits())
    }
}

/// What running a batch of collections produced.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    pub summary: RunSummary,
    /// Collections whose task panicked. They contribute nothing to the summary.
    pub failures: Vec<Failure>,
}

/// Chooses a worker budget and a strategy for collection-level concurrency.
#[derive(Debug, Clone)]
pub struct ParallelismController {
    budget: ThreadBudget,
    algorithm: ParallelAlgorithm,
    enabled: bool,
}

impl ParallelismController {
    pub fn new(budget: ThreadBudget, algorithm: ParallelAlgorithm, enabled: bool) -> Self {
        Self {
            budget,
            algorithm,
            enabled,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            ThreadBudget::resolve(config.max_parallel_threads),
            config.parallel_algorithm,
            !config.disable_parallelization,
        )
    }

    pub fn budget(&self) -> ThreadBudget {
        self.budget
    }

    pub fn algorithm(&self) -> ParallelAlgorithm {
        self.algorithm
    }

    pub fn parallelization_enabled(&self) -> bool {
        self.enabled
    }

    /// Minimum number of runtime workers the conservative algorithm needs.
    pub fn worker_floor(&self) -> Option<usize> {
        match (self.enabled, self.algorithm, self.budget) {
            (true, ParallelAlgorithm::Conservative, ThreadBudget::Limited(max)) => {
                Some(max.min(WORKER_FLOOR_CAP))
            }
            _ => None,
        }
    }

    /// The gate wrapped around awaited work inside collections.
    pub fn continuation_gate(&self) -> ContinuationGate {
        match (self.enabled, self.algorithm, self.budget) {
            (true, ParallelAlgorithm::Aggressive, ThreadBudget::Limited(max)) => {
                ContinuationGate::bounded(max)
            }
            _ => ContinuationGate::unbounded(),
        }
    }

    /// Runs `groups` through `start`.
    ///
    /// Parallel-eligible groups are launched first according to the
    /// algorithm; groups for which `is_serial` holds (all of them when
    /// parallelization is disabled) run afterwards one at a time. Cancellation
    /// stops new groups from starting; started groups run to completion.
    pub async fn run<T, S, F, Fut>(
        &self,
        groups: Vec<T>,
        is_serial: S,
        cancellation: &CancellationToken,
        start: F,
    ) -> ScheduleOutcome
    where
        S: Fn(&T) -> bool,
        F: Fn(T) -> Fut,
        Fut: Future<Output = RunSummary> + Send + 'static,
    {
        let (serial, parallel): (Vec<T>, Vec<T>) = if self.enabled {
            groups.into_iter().partition(|group| is_serial(group))
        } else {
            (groups, Vec::new())
        };

        let mut outcome = ScheduleOutcome::default();
        if !parallel.is_empty() {
            self.run_parallel(parallel, cancellation, &start, &mut outcome)
                .await;
        }

        for group in serial {
            if cancellation.is_cancelled() {
                debug!("cancellation requested; not starting further serial collections");
                break;
            }
            outcome.summary += start(group).await;
        }
        outcome
    }

    async fn run_parallel<T, F, Fut>(
        &self,
        groups: Vec<T>,
        cancellation: &CancellationToken,
        start: &F,
        outcome: &mut ScheduleOutcome,
    ) where
        F: Fn(T) -> Fut,
        Fut: Future<Output = RunSummary> + Send + 'static,
    {
        let semaphore = match (self.algorithm, self.budget) {
            (ParallelAlgorithm::Conservative, ThreadBudget::Limited(max)) => {
                Some(Arc::new(Semaphore::new(max)))
            }
            _ => None,
        };
        let pool = self.worker_floor().and_then(WorkerPool::for_floor);
        info!(
            collections = groups.len(),
            algorithm = %self.algorithm,
            budget = ?self.budget,
            dedicated_pool = pool.is_some(),
            "launching parallel collections"
        );

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            if cancellation.is_cancelled() {
                break;
            }
            let run = start(group);
            let semaphore = semaphore.clone();
            let token = cancellation.clone();
            let task = async move {
                let _permit = match semaphore {
                    Some(semaphore) => match semaphore.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return None,
                    },
                    None => None,
                };
                // Cancelled while queued for a permit: the collection never starts.
                if token.is_cancelled() {
                    return None;
                }
                Some(run.await)
            };
            handles.push(match &pool {
                Some(pool) => pool.spawn(task),
                None => tokio::spawn(task),
            });
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(Some(summary)) => outcome.summary += summary,
                Ok(None) => {}
                Err(join_error) if join_error.is_panic() => {
                    outcome.failures.push(Failure::from_panic(join_error.into_panic()));
                }
                Err(join_error) => debug!("collection task was cancelled: {join_error}"),
            }
        }
    }
}

/// A multi-thread runtime owned by the engine, used when the ambient runtime
/// has fewer workers than the conservative floor.
struct WorkerPool {
    runtime: Option<Runtime>,
}

impl WorkerPool {
    fn for_floor(floor: usize) -> Option<Self> {
        let ambient = Handle::try_current().ok()?;
        let workers = match ambient.runtime_flavor() {
            RuntimeFlavor::MultiThread => ambient.metrics().num_workers(),
            _ => 1,
        };
        if workers >= floor {
            return None;
        }
        match Builder::new_multi_thread()
            .worker_threads(floor)
            .thread_name("conductor-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => {
                debug!(workers, floor, "raising worker floor with a dedicated runtime");
                Some(Self {
                    runtime: Some(runtime),
                })
            }
            Err(e) => {
                warn!("could not build a dedicated worker runtime, using the ambient one: {e}");
                None
            }
        }
    }

    fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => runtime.spawn(task),
            None => tokio::spawn(task),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
