//! Bounded-concurrency batch executor.
//!
//! Runs a worker function over a list of items with at most `concurrency`
//! workers in flight. The executor knows nothing about stores or sync
//! semantics: every item yields either the worker's value or an
//! [`ItemFailure`], and the batch always runs to completion.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Progress hook: `(processed, total)`, fired once per completed item.
pub type ProgressHook = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Fired once for every item whose worker returned `Ok`.
pub type SuccessHook<I, R> = Box<dyn Fn(&I, &R) + Send + Sync>;

/// Fired once for every item whose worker failed, panicked or was aborted.
pub type ErrorHook<I, E> = Box<dyn Fn(&I, &ItemFailure<E>) + Send + Sync>;

/// Batch executor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of workers running at the same time
    pub concurrency: usize,
    /// Name for logging
    pub name: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            name: "batch".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Invalid executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("batch concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),
}

/// Why a single item did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFailure<E> {
    /// The worker returned an error.
    Error(E),
    /// The worker panicked; the panic was contained to this item.
    Panicked(String),
    /// The worker task was torn down before reporting (runtime shutdown).
    Aborted(String),
}

impl<E: core::fmt::Display> core::fmt::Display for ItemFailure<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ItemFailure::Error(e) => write!(f, "{e}"),
            ItemFailure::Panicked(msg) => write!(f, "worker panicked: {msg}"),
            ItemFailure::Aborted(msg) => write!(f, "worker aborted: {msg}"),
        }
    }
}

/// Outcome of one item, positioned like its input.
#[derive(Debug)]
pub struct ItemResult<I, R, E> {
    pub item: I,
    pub outcome: Result<R, ItemFailure<E>>,
}

impl<I, R, E> ItemResult<I, R, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ItemFailure<E>> {
        self.outcome.as_ref().err()
    }
}

/// Aggregate of a finished batch.
///
/// `results` preserves input order, not completion order.
#[derive(Debug)]
pub struct BatchSummary<I, R, E> {
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ItemResult<I, R, E>>,
}

impl<I, R, E> BatchSummary<I, R, E> {
    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// Runs a worker over a batch with a fixed worker budget.
///
/// Items are processed exactly once; retries belong inside the worker.
pub struct BatchExecutor<I, R, E> {
    config: BatchConfig,
    on_progress: Option<ProgressHook>,
    on_success: Option<SuccessHook<I, R>>,
    on_error: Option<ErrorHook<I, E>>,
}

impl<I, R, E> core::fmt::Debug for BatchExecutor<I, R, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("config", &self.config)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<I, R, E> BatchExecutor<I, R, E>
where
    I: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Create an executor, rejecting a zero worker budget.
    pub fn new(config: BatchConfig) -> Result<Self, BatchError> {
        if config.concurrency == 0 {
            return Err(BatchError::InvalidConcurrency(config.concurrency));
        }
        Ok(Self {
            config,
            on_progress: None,
            on_success: None,
            on_error: None,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn on_progress<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(hook));
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&I, &R) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&I, &ItemFailure<E>) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Run `worker` over every item and wait for the whole batch.
    ///
    /// Never fails because of an individual item: errors and panics are
    /// captured per item. Hooks fire in completion order from the calling
    /// task, so they never run concurrently with each other.
    pub async fn run<F, Fut>(&self, items: Vec<I>, worker: F) -> BatchSummary<I, R, E>
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let total = items.len();
        let worker = Arc::new(worker);
        let mut slots: Vec<Option<Result<R, ItemFailure<E>>>> = (0..total).map(|_| None).collect();
        let mut pending = items.iter().cloned().enumerate();
        let mut join_set = JoinSet::new();
        let mut processed = 0usize;

        debug!(
            batch = %self.config.name,
            total,
            concurrency = self.config.concurrency,
            "batch started"
        );

        loop {
            // Top the pool up to the worker budget.
            while join_set.len() < self.config.concurrency {
                let Some((index, item)) = pending.next() else {
                    break;
                };
                let worker = Arc::clone(&worker);
                join_set.spawn(async move {
                    let outcome = AssertUnwindSafe(worker(item)).catch_unwind().await;
                    (index, outcome)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((index, outcome)) => {
                    let outcome = match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(ItemFailure::Error(err)),
                        Err(payload) => {
                            Err(ItemFailure::Panicked(crate::panic::describe(payload.as_ref())))
                        }
                    };
                    processed += 1;
                    self.notify(&items[index], &outcome, processed, total);
                    slots[index] = Some(outcome);
                }
                Err(join_error) => {
                    // Index is unknown here; the slot is filled in below.
                    error!(batch = %self.config.name, error = %join_error, "batch worker task lost");
                }
            }
        }

        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let outcome = Err(ItemFailure::Aborted("task did not report".to_string()));
                processed += 1;
                self.notify(&items[index], &outcome, processed, total);
                *slot = Some(outcome);
            }
        }

        let results: Vec<ItemResult<I, R, E>> = items
            .into_iter()
            .zip(slots.into_iter().flatten())
            .map(|(item, outcome)| ItemResult { item, outcome })
            .collect();

        let successful = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - successful;

        debug!(batch = %self.config.name, successful, failed, "batch finished");

        BatchSummary {
            successful,
            failed,
            results,
        }
    }

    fn notify(&self, item: &I, outcome: &Result<R, ItemFailure<E>>, processed: usize, total: usize) {
        match outcome {
            Ok(value) => {
                if let Some(hook) = &self.on_success {
                    hook(item, value);
                }
            }
            Err(failure) => {
                if let Some(hook) = &self.on_error {
                    hook(item, failure);
                }
            }
        }
        if let Some(hook) = &self.on_progress {
            hook(processed, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = BatchExecutor::<u32, u32, String>::new(BatchConfig::new(0)).unwrap_err();
        assert_eq!(err, BatchError::InvalidConcurrency(0));
    }

    #[tokio::test]
    async fn empty_batch_fires_no_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let executor = BatchExecutor::<u32, u32, String>::new(BatchConfig::new(3))
            .unwrap()
            .on_progress(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            });

        let summary = executor.run(vec![], |n| async move { Ok(n) }).await;

        assert_eq!(summary.total(), 0);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn errors_and_panics_become_item_failures() {
        let executor = BatchExecutor::<u32, u32, String>::new(BatchConfig::new(2)).unwrap();

        let summary = executor
            .run(vec![1, 2, 3, 4], |n| async move {
                match n {
                    2 => Err(format!("item {n} failed")),
                    3 => panic!("item 3 exploded"),
                    _ => Ok(n * 10),
                }
            })
            .await;

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.results[0].result(), Some(&10));
        assert_eq!(
            summary.results[1].error(),
            Some(&ItemFailure::Error("item 2 failed".to_string()))
        );
        assert!(matches!(
            summary.results[2].error(),
            Some(ItemFailure::Panicked(msg)) if msg.contains("exploded")
        ));
        assert_eq!(summary.results[3].result(), Some(&40));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_follow_input_order_not_completion_order() {
        let executor = BatchExecutor::<u64, u64, String>::new(BatchConfig::new(4)).unwrap();

        // Earlier items sleep longer, so they complete last.
        let summary = executor
            .run(vec![40, 30, 20, 10], |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .await;

        let order: Vec<u64> = summary.results.iter().map(|r| r.item).collect();
        assert_eq!(order, vec![40, 30, 20, 10]);
        assert!(summary.results.iter().all(|r| r.result() == Some(&r.item)));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_reaches_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let executor = BatchExecutor::<u32, (), String>::new(BatchConfig::new(3))
            .unwrap()
            .on_progress(move |processed, total| s.lock().unwrap().push((processed, total)));

        executor.run((0..7).collect(), |_| async { Ok(()) }).await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (1..=7).map(|p| (p, 7)).collect::<Vec<_>>());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn bounded_concurrency_and_exactly_once(
            outcomes in proptest::collection::vec(any::<bool>(), 1..40),
            concurrency in 1usize..8,
        ) {
            let rt = runtime();
            let n = outcomes.len();
            let invocations = Arc::new(AtomicUsize::new(0));
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let success_hooks = Arc::new(AtomicUsize::new(0));
            let error_hooks = Arc::new(AtomicUsize::new(0));

            let (sh, eh) = (success_hooks.clone(), error_hooks.clone());
            let executor = BatchExecutor::<(usize, bool), usize, String>::new(BatchConfig::new(concurrency))
                .unwrap()
                .on_success(move |_, _| { sh.fetch_add(1, Ordering::SeqCst); })
                .on_error(move |_, _| { eh.fetch_add(1, Ordering::SeqCst); });

            let items: Vec<(usize, bool)> = outcomes.iter().copied().enumerate().collect();
            let (inv, act, pk) = (invocations.clone(), active.clone(), peak.clone());
            let summary = rt.block_on(executor.run(items, move |(index, ok)| {
                let (inv, act, pk) = (inv.clone(), act.clone(), pk.clone());
                async move {
                    inv.fetch_add(1, Ordering::SeqCst);
                    let now = act.fetch_add(1, Ordering::SeqCst) + 1;
                    pk.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    act.fetch_sub(1, Ordering::SeqCst);
                    if ok { Ok(index) } else { Err(format!("item {index}")) }
                }
            }));

            prop_assert_eq!(invocations.load(Ordering::SeqCst), n);
            prop_assert_eq!(summary.results.len(), n);
            prop_assert!(peak.load(Ordering::SeqCst) <= concurrency);
            prop_assert_eq!(summary.successful + summary.failed, n);
            prop_assert_eq!(summary.successful, success_hooks.load(Ordering::SeqCst));
            prop_assert_eq!(summary.failed, error_hooks.load(Ordering::SeqCst));
            for (position, result) in summary.results.iter().enumerate() {
                prop_assert_eq!(result.item.0, position);
                prop_assert_eq!(result.is_success(), outcomes[position]);
            }
        }
    }
}
