use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::Result;
use crate::adapter::{RequestAdapter, ResponseAdapter};
use crate::error::Error;
use crate::request::{Request, RequestKey};
use crate::retry::{Retrier, RetryPlan};
use crate::util::lock_unpoisoned;

struct Cycle<T> {
    waiters: Vec<oneshot::Sender<Result<T>>>,
    in_flight: Option<AbortHandle>,
}

struct BarrierState<K, T> {
    torn_down: bool,
    cycles: HashMap<K, Cycle<T>>,
}

type SharedState<K, T> = Arc<Mutex<BarrierState<K, T>>>;

/// Collapses overlapping calls with equal keys into one underlying operation.
///
/// A call that arrives while a call with the same key is in flight joins it
/// and receives the same result. Calls with other keys run their own cycle.
/// Once an operation resolves its key is idle again and the next call starts
/// a fresh cycle. Dropping the barrier fails every pending waiter with
/// [`Error::BarrierTornDown`].
pub struct KeyedCallBarrier<K, T> {
    state: SharedState<K, T>,
}

impl<K, T> KeyedCallBarrier<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BarrierState {
                torn_down: false,
                cycles: HashMap::new(),
            })),
        }
    }

    pub fn is_processing(&self, key: &K) -> bool {
        lock_unpoisoned(&self.state).cycles.contains_key(key)
    }

    pub fn in_flight_keys(&self) -> usize {
        lock_unpoisoned(&self.state).cycles.len()
    }

    pub fn pending_waiters(&self) -> usize {
        lock_unpoisoned(&self.state)
            .cycles
            .values()
            .map(|cycle| cycle.waiters.len())
            .sum()
    }

    /// `operation` only runs when no call with `key` is in flight.
    pub fn call<F, Fut>(
        &self,
        key: K,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        async move {
            let (sender, receiver) = oneshot::channel();
            let starts_cycle = {
                let mut guard = lock_unpoisoned(&state);
                if guard.torn_down {
                    return Err(Error::BarrierTornDown);
                }
                match guard.cycles.entry(key.clone()) {
                    Entry::Occupied(mut cycle) => {
                        cycle.get_mut().waiters.push(sender);
                        false
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Cycle {
                            waiters: vec![sender],
                            in_flight: None,
                        });
                        true
                    }
                }
            };

            if starts_cycle {
                start_cycle(&state, key, operation());
            }

            receiver.await.unwrap_or(Err(Error::BarrierTornDown))
        }
    }
}

impl<K, T> Default for KeyedCallBarrier<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Drop for KeyedCallBarrier<K, T> {
    fn drop(&mut self) {
        let cycles = {
            let mut guard = lock_unpoisoned(&self.state);
            guard.torn_down = true;
            std::mem::take(&mut guard.cycles)
        };
        for (_, cycle) in cycles {
            if let Some(task) = cycle.in_flight {
                task.abort();
            }
            for waiter in cycle.waiters {
                let _ = waiter.send(Err(Error::BarrierTornDown));
            }
        }
    }
}

fn start_cycle<K, T, Fut>(state: &SharedState<K, T>, key: K, operation: Fut)
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let Ok(runtime) = Handle::try_current() else {
        finish_cycle(state, &key, Err(Error::RuntimeUnavailable));
        return;
    };

    // The spawned task cannot finish the cycle before its abort handle is
    // recorded: both sides take the same lock.
    let mut guard = lock_unpoisoned(state);
    if guard.torn_down {
        return;
    }
    let task_state = Arc::clone(state);
    let task_key = key.clone();
    let task = runtime.spawn(async move {
        let result = operation.await;
        finish_cycle(&task_state, &task_key, result);
    });
    if let Some(cycle) = guard.cycles.get_mut(&key) {
        cycle.in_flight = Some(task.abort_handle());
    }
}

fn finish_cycle<K, T>(state: &Mutex<BarrierState<K, T>>, key: &K, result: Result<T>)
where
    K: Eq + Hash,
    T: Clone,
{
    let cycle = lock_unpoisoned(state).cycles.remove(key);
    for waiter in cycle.into_iter().flat_map(|cycle| cycle.waiters) {
        let _ = waiter.send(result.clone());
    }
}

/// Collapses every overlapping call into one underlying operation, whatever
/// the caller asked for.
pub struct CallBarrier<T> {
    inner: KeyedCallBarrier<(), T>,
}

impl<T> CallBarrier<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: KeyedCallBarrier::new(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.is_processing(&())
    }

    pub fn pending_waiters(&self) -> usize {
        self.inner.pending_waiters()
    }

    /// `operation` only runs when this call finds the barrier idle.
    pub fn call<F, Fut>(&self, operation: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.call((), operation)
    }
}

impl<T> Default for CallBarrier<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Shares one adaptation among equal requests that overlap in time, typically
/// a credential refresh. Requests that differ in method, URL, headers or body
/// are adapted separately.
pub struct RequestAdapterBarrier {
    adapter: Arc<dyn RequestAdapter>,
    barrier: KeyedCallBarrier<RequestKey, Request>,
}

impl RequestAdapterBarrier {
    pub fn new(adapter: Arc<dyn RequestAdapter>) -> Self {
        Self {
            adapter,
            barrier: KeyedCallBarrier::new(),
        }
    }
}

impl RequestAdapter for RequestAdapterBarrier {
    fn adapt(&self, request: Request) -> BoxFuture<'_, Result<Request>> {
        let adapter = Arc::clone(&self.adapter);
        let key = request.barrier_key();
        Box::pin(
            self.barrier
                .call(key, move || async move { adapter.adapt(request).await }),
        )
    }
}

/// Shares one adaptation among identical response bodies that overlap in time.
pub struct ResponseAdapterBarrier {
    adapter: Arc<dyn ResponseAdapter>,
    barrier: KeyedCallBarrier<Bytes, Bytes>,
}

impl ResponseAdapterBarrier {
    pub fn new(adapter: Arc<dyn ResponseAdapter>) -> Self {
        Self {
            adapter,
            barrier: KeyedCallBarrier::new(),
        }
    }
}

impl ResponseAdapter for ResponseAdapterBarrier {
    fn adapt(&self, body: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        let adapter = Arc::clone(&self.adapter);
        let key = body.clone();
        Box::pin(
            self.barrier
                .call(key, move || async move { adapter.adapt(body).await }),
        )
    }
}

/// Lets tasks failing together wait on a single retry decision.
pub struct RetryBarrier {
    retrier: Arc<dyn Retrier>,
    barrier: CallBarrier<RetryPlan>,
}

impl RetryBarrier {
    pub fn new(retrier: Arc<dyn Retrier>) -> Self {
        Self {
            retrier,
            barrier: CallBarrier::new(),
        }
    }
}

impl Retrier for RetryBarrier {
    fn retry<'a>(&'a self, error: &'a Error, attempt: usize) -> BoxFuture<'a, RetryPlan> {
        let retrier = Arc::clone(&self.retrier);
        let error = error.clone();
        let decision = self
            .barrier
            .call(move || async move { Ok(retrier.retry(&error, attempt).await) });
        Box::pin(async move {
            match decision.await {
                Ok(plan) => plan,
                Err(error) => {
                    warn!(error = %error, "retry barrier could not serve the decision");
                    RetryPlan::DoNotRetry
                }
            }
        })
    }
}

/// Wraps a shared stage in its call barrier.
pub trait WithBarrier {
    fn with_barrier(self) -> Self;
}

impl WithBarrier for Arc<dyn RequestAdapter> {
    fn with_barrier(self) -> Self {
        Arc::new(RequestAdapterBarrier::new(self))
    }
}

impl WithBarrier for Arc<dyn ResponseAdapter> {
    fn with_barrier(self) -> Self {
        Arc::new(ResponseAdapterBarrier::new(self))
    }
}

impl WithBarrier for Arc<dyn Retrier> {
    fn with_barrier(self) -> Self {
        Arc::new(RetryBarrier::new(self))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use bytes::Bytes;

    use super::{CallBarrier, KeyedCallBarrier, WithBarrier};
    use crate::Result;
    use crate::adapter::{RequestAdapter, ResponseAdapter, request_adapter_fn, response_adapter_fn};
    use crate::error::Error;
    use crate::request::Request;
    use crate::retry::{RetryPlan, Retrier, retrier_fn};

    async fn wait_for_waiters<T: Clone + Send + 'static>(barrier: &CallBarrier<T>, expected: usize) {
        for _ in 0..2000 {
            if barrier.pending_waiters() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "barrier only saw {} of {expected} waiters",
            barrier.pending_waiters()
        );
    }

    fn gated_operation(
        calls: &Arc<AtomicUsize>,
        gate: &Arc<Semaphore>,
        value: u64,
    ) -> impl FnOnce() -> futures_util::future::BoxFuture<'static, Result<u64>> + Send + 'static {
        let calls = Arc::clone(calls);
        let gate = Arc::clone(gate);
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.map_err(|_| Error::Cancelled)?;
                Ok(value)
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hundred_concurrent_calls_share_one_operation() {
        let barrier = Arc::new(CallBarrier::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let mut tasks = Vec::new();
        for index in 0..100_u64 {
            let pending = barrier.call(gated_operation(&calls, &gate, index));
            tasks.push(tokio::spawn(pending));
        }
        wait_for_waiters(&barrier, 100).await;
        gate.add_permits(1);

        let mut results = Vec::new();
        for task in tasks {
            results.push(
                task.await
                    .expect("waiter task should join")
                    .expect("barrier result should be ok"),
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|value| *value == results[0]));
        assert!(!barrier.is_processing());
    }

    #[tokio::test]
    async fn call_after_completion_starts_a_fresh_cycle() {
        let barrier = CallBarrier::<u64>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(Semaphore::MAX_PERMITS));

        let first = barrier.call(gated_operation(&calls, &gate, 1)).await;
        let second = barrier.call(gated_operation(&calls, &gate, 2)).await;
        assert_eq!(first.expect("first cycle should succeed"), 1);
        assert_eq!(second.expect("second cycle should succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_fan_out_to_every_waiter() {
        let barrier = Arc::new(CallBarrier::<u64>::new());
        let gate = Arc::new(Semaphore::new(0));
        let gate_for_operation = Arc::clone(&gate);

        let first = tokio::spawn(barrier.call(move || async move {
            let _permit = gate_for_operation.acquire().await;
            Err(Error::rejected(
                crate::error::AdapterStage::Request,
                "refresh token expired",
            ))
        }));
        wait_for_waiters(&barrier, 1).await;
        let second = tokio::spawn(barrier.call(|| async { Ok(99) }));
        wait_for_waiters(&barrier, 2).await;
        gate.add_permits(1);

        for task in [first, second] {
            let error = task
                .await
                .expect("waiter task should join")
                .expect_err("shared failure should reach every waiter");
            assert!(matches!(error, Error::AdapterRejected { .. }));
        }
    }

    #[tokio::test]
    async fn dropping_the_barrier_fails_pending_waiters() {
        let barrier = CallBarrier::<u64>::new();
        let pending = tokio::spawn(barrier.call(|| std::future::pending::<Result<u64>>()));
        wait_for_waiters(&barrier, 1).await;

        drop(barrier);
        let error = pending
            .await
            .expect("waiter task should join")
            .expect_err("torn down barrier must fail the waiter");
        assert!(matches!(error, Error::BarrierTornDown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn request_adapter_barrier_adapts_once_for_overlapping_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_adapter = Arc::clone(&calls);
        let adapter = request_adapter_fn(move |request: Request| {
            let calls = Arc::clone(&calls_for_adapter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                request.try_with_header("authorization", "Bearer refreshed")
            }
        })
        .with_barrier();

        let request = Request::get("https://api.example.com/api/v1/employees")
            .build()
            .expect("request should build");
        let adapted = futures_util::future::join_all(
            (0..10).map(|_| adapter.adapt(request.clone())),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in adapted {
            let request = result.expect("shared adaptation should succeed");
            assert_eq!(
                request
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok()),
                Some("Bearer refreshed")
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn request_adapter_barrier_keeps_different_requests_apart() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_adapter = Arc::clone(&calls);
        let adapter = request_adapter_fn(move |request: Request| {
            let calls = Arc::clone(&calls_for_adapter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(request)
            }
        })
        .with_barrier();

        let users = Request::get("https://api.example.com/users")
            .build()
            .expect("request should build");
        let payments = Request::get("https://api.example.com/payments")
            .build()
            .expect("request should build");
        let (users_adapted, payments_adapted, users_again) = tokio::join!(
            adapter.adapt(users.clone()),
            adapter.adapt(payments),
            adapter.adapt(users),
        );

        assert_eq!(
            users_adapted.expect("users should adapt").url(),
            "https://api.example.com/users"
        );
        assert_eq!(
            payments_adapted.expect("payments should adapt").url(),
            "https://api.example.com/payments"
        );
        assert_eq!(
            users_again.expect("users should adapt").url(),
            "https://api.example.com/users"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn response_adapter_barrier_keeps_different_bodies_apart() {
        let adapter = response_adapter_fn(|body: Bytes| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut upper = body.to_vec();
            upper.make_ascii_uppercase();
            Ok(Bytes::from(upper))
        })
        .with_barrier();

        let (first, second) = tokio::join!(
            adapter.adapt(Bytes::from_static(b"alpha")),
            adapter.adapt(Bytes::from_static(b"beta")),
        );
        assert_eq!(first.expect("alpha should adapt"), Bytes::from_static(b"ALPHA"));
        assert_eq!(second.expect("beta should adapt"), Bytes::from_static(b"BETA"));
    }

    #[tokio::test]
    async fn keyed_barrier_releases_each_key_independently() {
        let barrier = KeyedCallBarrier::<&'static str, u64>::new();
        let gate = Arc::new(Semaphore::new(0));
        let gate_for_operation = Arc::clone(&gate);

        let slow = tokio::spawn(barrier.call("slow", move || async move {
            let _permit = gate_for_operation.acquire().await;
            Ok(1)
        }));
        for _ in 0..2000 {
            if barrier.is_processing(&"slow") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let fast = barrier.call("fast", || async { Ok(2) }).await;

        assert_eq!(fast.expect("fast key should not wait"), 2);
        assert!(barrier.is_processing(&"slow"));
        assert!(!barrier.is_processing(&"fast"));
        assert_eq!(barrier.in_flight_keys(), 1);

        gate.add_permits(1);
        let slow = slow
            .await
            .expect("waiter task should join")
            .expect("slow key should resolve");
        assert_eq!(slow, 1);
        assert_eq!(barrier.in_flight_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_barrier_shares_one_decision() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_retrier = Arc::clone(&calls);
        let retrier: Arc<dyn Retrier> = retrier_fn(move |_error, _attempt| {
            let calls = Arc::clone(&calls_for_retrier);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                RetryPlan::RetryNow
            }
        })
        .with_barrier();

        let error = Error::Cancelled;
        let plans =
            futures_util::future::join_all((0..5).map(|_| retrier.retry(&error, 1))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(plans.iter().all(|plan| *plan == RetryPlan::RetryNow));
    }
}
