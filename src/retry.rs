use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use rand::RngExt;
use tracing::debug;

use crate::error::{Error, TransportErrorKind};
use crate::util::parse_retry_after;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryPlan {
    RetryNow,
    DoNotRetry,
}

impl RetryPlan {
    pub const fn is_retry(self) -> bool {
        matches!(self, Self::RetryNow)
    }
}

/// Votes on whether a failed attempt should run again.
///
/// `attempt` is the 1-based number of the retry being considered. A vote is
/// advisory; the task execution enforces its own retry ceiling.
pub trait Retrier: Send + Sync {
    fn retry<'a>(&'a self, error: &'a Error, attempt: usize) -> BoxFuture<'a, RetryPlan>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetrier;

impl Retrier for NoRetrier {
    fn retry<'a>(&'a self, _error: &'a Error, _attempt: usize) -> BoxFuture<'a, RetryPlan> {
        Box::pin(async { RetryPlan::DoNotRetry })
    }
}

/// Asks each retrier in order; the first `RetryNow` wins.
#[derive(Clone, Default)]
pub struct RetryFunnel {
    retriers: Vec<Arc<dyn Retrier>>,
}

impl RetryFunnel {
    pub fn new(retriers: Vec<Arc<dyn Retrier>>) -> Self {
        Self { retriers }
    }

    pub fn len(&self) -> usize {
        self.retriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retriers.is_empty()
    }

    pub async fn decide(&self, error: &Error, attempt: usize) -> RetryPlan {
        for retrier in &self.retriers {
            if retrier.retry(error, attempt).await.is_retry() {
                return RetryPlan::RetryNow;
            }
        }
        RetryPlan::DoNotRetry
    }
}

impl Retrier for RetryFunnel {
    fn retry<'a>(&'a self, error: &'a Error, attempt: usize) -> BoxFuture<'a, RetryPlan> {
        Box::pin(self.decide(error, attempt))
    }
}

impl std::fmt::Debug for RetryFunnel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryFunnel")
            .field("retriers", &self.retriers.len())
            .finish()
    }
}

pub struct RetrierFn<F> {
    decide: F,
}

impl<F, Fut> Retrier for RetrierFn<F>
where
    F: Fn(Error, usize) -> Fut + Send + Sync,
    Fut: Future<Output = RetryPlan> + Send + 'static,
{
    fn retry<'a>(&'a self, error: &'a Error, attempt: usize) -> BoxFuture<'a, RetryPlan> {
        Box::pin((self.decide)(error.clone(), attempt))
    }
}

pub fn retrier_fn<F, Fut>(decide: F) -> Arc<dyn Retrier>
where
    F: Fn(Error, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RetryPlan> + Send + 'static,
{
    Arc::new(RetrierFn { decide })
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, error: &Error, attempt: usize) -> bool;
}

/// Retries transient failures after an exponential, jittered pause.
///
/// A `Retry-After` header on a status failure replaces the computed pause.
#[derive(Clone)]
pub struct BackoffRetrier {
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_on_timeout: bool,
    honor_retry_after: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for BackoffRetrier {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackoffRetrier")
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("honor_retry_after", &self.honor_retry_after)
            .field("custom_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl BackoffRetrier {
    pub fn standard() -> Self {
        Self {
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retry_on_timeout: true,
            honor_retry_after: true,
            retry_classifier: None,
        }
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub(crate) fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(error, attempt);
        }
        match error {
            Error::HttpStatus { status, .. } => self.retryable_status_codes.contains(status),
            Error::Transport { kind, .. } => self.retryable_transport_error_kinds.contains(kind),
            Error::Timeout { .. } => self.retry_on_timeout,
            _ => false,
        }
    }

    pub(crate) fn delay_for(&self, error: &Error, attempt: usize) -> Duration {
        if self.honor_retry_after
            && let Some(headers) = error.response_headers()
            && let Some(delay) = parse_retry_after(headers, SystemTime::now())
        {
            return delay;
        }
        self.backoff_for_retry(attempt)
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for BackoffRetrier {
    fn default() -> Self {
        Self::standard()
    }
}

impl Retrier for BackoffRetrier {
    fn retry<'a>(&'a self, error: &'a Error, attempt: usize) -> BoxFuture<'a, RetryPlan> {
        Box::pin(async move {
            if !self.should_retry(error, attempt) {
                return RetryPlan::DoNotRetry;
            }
            let delay = self.delay_for(error, attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error_code = error.code().as_str(),
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
            RetryPlan::RetryNow
        })
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use http::header::RETRY_AFTER;
    use http::{HeaderMap, HeaderValue, Method};

    use super::{BackoffRetrier, NoRetrier, RetryClassifier, RetryFunnel, RetryPlan, Retrier, retrier_fn};
    use crate::error::{Error, TransportErrorKind};

    fn status_error(status: u16, headers: HeaderMap) -> Error {
        Error::HttpStatus {
            status,
            method: Method::GET,
            uri: "https://api.example.com/v1/items".to_owned(),
            headers: Box::new(headers),
            request_headers: Box::new(HeaderMap::new()),
            body: Some(Bytes::from_static(b"oops")),
        }
    }

    fn counting_retrier(plan: RetryPlan, calls: Arc<AtomicUsize>) -> Arc<dyn Retrier> {
        retrier_fn(move |_error, _attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                plan
            }
        })
    }

    #[tokio::test]
    async fn empty_funnel_never_retries() {
        let funnel = RetryFunnel::default();
        assert_eq!(
            funnel.decide(&Error::Cancelled, 1).await,
            RetryPlan::DoNotRetry
        );
    }

    #[tokio::test]
    async fn funnel_stops_at_first_retry_vote() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let funnel = RetryFunnel::new(vec![
            counting_retrier(RetryPlan::DoNotRetry, Arc::clone(&first)),
            counting_retrier(RetryPlan::RetryNow, Arc::clone(&second)),
            counting_retrier(RetryPlan::RetryNow, Arc::clone(&third)),
        ]);

        let plan = funnel.retry(&status_error(500, HeaderMap::new()), 1).await;
        assert_eq!(plan, RetryPlan::RetryNow);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn funnel_of_refusals_is_terminal() {
        let retriers: Vec<Arc<dyn Retrier>> = vec![Arc::new(NoRetrier), Arc::new(NoRetrier)];
        let funnel = RetryFunnel::new(retriers);
        assert_eq!(
            funnel.decide(&status_error(503, HeaderMap::new()), 1).await,
            RetryPlan::DoNotRetry
        );
    }

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let retrier = BackoffRetrier::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            assert!(retrier.backoff_for_retry(3) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn backoff_doubles_per_retry_without_jitter() {
        let retrier = BackoffRetrier::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10))
            .jitter_ratio(0.0);

        assert_eq!(retrier.backoff_for_retry(1), Duration::from_millis(100));
        assert_eq!(retrier.backoff_for_retry(2), Duration::from_millis(200));
        assert_eq!(retrier.backoff_for_retry(4), Duration::from_millis(800));
    }

    #[test]
    fn standard_retrier_classifies_transient_failures() {
        let retrier = BackoffRetrier::standard();
        assert!(retrier.should_retry(&status_error(503, HeaderMap::new()), 1));
        assert!(!retrier.should_retry(&status_error(404, HeaderMap::new()), 1));
        assert!(retrier.should_retry(
            &Error::Timeout {
                timeout_ms: 10,
                method: Method::GET,
                uri: "https://api.example.com".to_owned(),
            },
            1
        ));
        assert!(!retrier.should_retry(&Error::Cancelled, 1));

        let tls = Error::Transport {
            kind: TransportErrorKind::Tls,
            method: Method::GET,
            uri: "https://api.example.com".to_owned(),
            source: Arc::new(std::io::Error::other("bad certificate")),
        };
        assert!(!retrier.should_retry(&tls, 1));
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let retrier = BackoffRetrier::standard().jitter_ratio(0.0);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
        assert_eq!(
            retrier.delay_for(&status_error(429, headers), 3),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn custom_classifier_replaces_default_rules() {
        struct OnlyFirstAttempt;

        impl RetryClassifier for OnlyFirstAttempt {
            fn should_retry(&self, _error: &Error, attempt: usize) -> bool {
                attempt == 1
            }
        }

        let retrier = BackoffRetrier::standard()
            .base_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(1))
            .retry_classifier(Arc::new(OnlyFirstAttempt));

        assert_eq!(
            retrier.retry(&Error::Cancelled, 1).await,
            RetryPlan::RetryNow
        );
        assert_eq!(
            retrier.retry(&Error::Cancelled, 2).await,
            RetryPlan::DoNotRetry
        );
    }
}
