use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::Result;
use crate::adapter::{RequestAdapterChain, ResponseAdapterChain};
use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::request::{Request, TaskKind};
use crate::retry::{RetryFunnel, RetryPlan};
use crate::transport::{ProgressHandler, Transport, TransportResponse};
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

/// Receives the outcome of a submitted task.
///
/// The pipeline invokes it at most once per task. [`crate::CachedService`]
/// may invoke it a second time with cached bytes.
pub type Completion = Arc<dyn Fn(Result<Bytes>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Ready,
    Executing,
    Finished,
}

/// Stages shared by every task of a client.
pub(crate) struct Pipeline {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) request_adapters: RequestAdapterChain,
    pub(crate) response_adapters: ResponseAdapterChain,
    pub(crate) retry_funnel: RetryFunnel,
    pub(crate) max_retries: usize,
    pub(crate) metrics: Option<ClientMetrics>,
}

struct ExecutionCell {
    state: ExecutionState,
    retries: usize,
    completion: Option<Completion>,
}

enum RetryGate {
    Proceed(usize),
    Exhausted,
    Finished,
}

/// Drives one request from adaptation to its single completion.
pub(crate) struct TaskExecution {
    id: u64,
    request: Request,
    kind: TaskKind,
    progress: Option<ProgressHandler>,
    pipeline: Arc<Pipeline>,
    cancellation: CancellationToken,
    cell: Mutex<ExecutionCell>,
}

impl TaskExecution {
    pub(crate) fn new(
        id: u64,
        request: Request,
        kind: TaskKind,
        progress: Option<ProgressHandler>,
        completion: Completion,
        pipeline: Arc<Pipeline>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            request,
            kind,
            progress,
            pipeline,
            cancellation,
            cell: Mutex::new(ExecutionCell {
                state: ExecutionState::Ready,
                retries: 0,
                completion: Some(completion),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ExecutionState {
        lock_unpoisoned(&self.cell).state
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Forces the task to `Finished` without delivering anything.
    ///
    /// Returns false when the task had already finished.
    pub(crate) fn cancel(&self) -> bool {
        let completion = {
            let mut cell = lock_unpoisoned(&self.cell);
            if cell.state == ExecutionState::Finished {
                return false;
            }
            cell.state = ExecutionState::Finished;
            cell.completion.take()
        };
        self.cancellation.cancel();
        drop(completion);
        if let Some(metrics) = &self.pipeline.metrics {
            metrics.record_task_cancelled();
        }
        debug!(task_id = self.id, "task cancelled");
        true
    }

    /// Delivers a terminal failure without running the pipeline, e.g. when the
    /// scheduler shuts down before the task started.
    pub(crate) fn fail(&self, error: Error) {
        self.deliver(Err(error), Instant::now());
    }

    pub(crate) async fn run(&self) {
        if !self.begin() {
            return;
        }

        let span = info_span!(
            "reqflow.task",
            task_id = self.id,
            method = %self.request.method(),
            uri = %redact_uri_for_logs(self.request.url()),
            kind = self.kind.as_str()
        );
        let _in_flight = self
            .pipeline
            .metrics
            .as_ref()
            .map(ClientMetrics::enter_in_flight);
        self.drive().instrument(span).await;
    }

    fn begin(&self) -> bool {
        {
            let mut cell = lock_unpoisoned(&self.cell);
            if cell.state != ExecutionState::Ready {
                return false;
            }
            if !self.cancellation.is_cancelled() {
                cell.state = ExecutionState::Executing;
                return true;
            }
        }
        self.cancel();
        false
    }

    async fn drive(&self) {
        let started_at = Instant::now();
        loop {
            let Some(adapted) = self
                .until_cancelled(self.pipeline.request_adapters.run(self.request.clone()))
                .await
            else {
                return;
            };
            let adapted = match adapted {
                Ok(request) => request,
                Err(error) => {
                    debug!(error = %error, "request adaptation failed");
                    self.deliver(Err(error), started_at);
                    return;
                }
            };

            let Some(outcome) = self.until_cancelled(self.attempt(&adapted)).await else {
                return;
            };
            let error = match outcome {
                Ok(body) => {
                    self.deliver(Ok(body), started_at);
                    return;
                }
                Err(error) => error,
            };

            let retry = match self.next_retry() {
                RetryGate::Finished => return,
                RetryGate::Exhausted => {
                    debug!(error = %error, "retry ceiling reached");
                    self.deliver(Err(error), started_at);
                    return;
                }
                RetryGate::Proceed(retry) => retry,
            };

            let Some(plan) = self
                .until_cancelled(self.pipeline.retry_funnel.decide(&error, retry))
                .await
            else {
                return;
            };
            match plan {
                RetryPlan::RetryNow => {
                    if let Some(metrics) = &self.pipeline.metrics {
                        metrics.record_retry();
                    }
                    warn!(retry, max_retries = self.pipeline.max_retries, error = %error, "retrying task");
                }
                RetryPlan::DoNotRetry => {
                    debug!(error = %error, "retry declined");
                    self.deliver(Err(error), started_at);
                    return;
                }
            }
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Bytes> {
        if let Some(metrics) = &self.pipeline.metrics {
            metrics.record_attempt();
        }
        debug!("sending request");
        trace!(curl = %request.to_curl(false), "adapted request");

        let progress = self.progress.as_ref().map(|progress| {
            let progress = Arc::clone(progress);
            let cancellation = self.cancellation.clone();
            Arc::new(move |fraction: f64| {
                if !cancellation.is_cancelled() {
                    progress(fraction);
                }
            }) as ProgressHandler
        });

        let response = self
            .pipeline
            .transport
            .execute(request, &self.kind, progress)
            .await;
        let body = match response {
            Ok(response) => {
                debug!(
                    status = response.status.as_u16(),
                    bytes = response.body.as_ref().map_or(0, Bytes::len),
                    "response received"
                );
                into_success_body(request, response)?
            }
            Err(error) => {
                debug!(error_code = error.code().as_str(), error = %error, "exchange failed");
                return Err(error);
            }
        };
        self.pipeline.response_adapters.run(Ok(body)).await
    }

    fn next_retry(&self) -> RetryGate {
        let mut cell = lock_unpoisoned(&self.cell);
        if cell.state == ExecutionState::Finished {
            return RetryGate::Finished;
        }
        if cell.retries >= self.pipeline.max_retries {
            return RetryGate::Exhausted;
        }
        cell.retries += 1;
        RetryGate::Proceed(cell.retries)
    }

    fn deliver(&self, outcome: Result<Bytes>, started_at: Instant) {
        let completion = {
            let mut cell = lock_unpoisoned(&self.cell);
            if cell.state == ExecutionState::Finished {
                return;
            }
            cell.state = ExecutionState::Finished;
            cell.completion.take()
        };
        if let Some(metrics) = &self.pipeline.metrics {
            metrics.record_task_completed(&outcome, started_at.elapsed());
        }
        match &outcome {
            Ok(body) => debug!(bytes = body.len(), "task succeeded"),
            Err(error) => debug!(error_code = error.code().as_str(), "task failed"),
        }
        if let Some(completion) = completion {
            completion(outcome);
        }
    }

    /// `None` once cancelled; the stage future is dropped on the spot.
    async fn until_cancelled<F>(&self, stage: F) -> Option<F::Output>
    where
        F: Future,
    {
        let output = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => None,
            output = stage => Some(output),
        };
        if output.is_none() {
            self.cancel();
        }
        output
    }
}

fn into_success_body(request: &Request, response: TransportResponse) -> Result<Bytes> {
    if response.status.is_success() {
        return Ok(response.body.unwrap_or_default());
    }
    Err(Error::HttpStatus {
        status: response.status.as_u16(),
        method: request.method().clone(),
        uri: redact_uri_for_logs(request.url()),
        headers: Box::new(response.headers),
        request_headers: Box::new(request.headers().clone()),
        body: response.body,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::StatusCode;
    use tokio_util::sync::CancellationToken;

    use super::{Completion, ExecutionState, Pipeline, TaskExecution};
    use crate::Result;
    use crate::adapter::{RequestAdapterChain, ResponseAdapterChain, request_adapter_fn};
    use crate::error::{AdapterStage, Error};
    use crate::request::{Request, TaskKind};
    use crate::retry::{RetryFunnel, RetryPlan, retrier_fn};
    use crate::transport::{ProgressHandler, Transport, TransportResponse};

    struct ScriptedTransport {
        calls: AtomicUsize,
        responses: Mutex<Vec<TransportResponse>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            })
        }
    }

    impl Transport for ScriptedTransport {
        fn execute<'a>(
            &'a self,
            _request: &'a Request,
            _kind: &'a TaskKind,
            progress: Option<ProgressHandler>,
        ) -> BoxFuture<'a, Result<TransportResponse>> {
            Box::pin(async move {
                let index = self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(progress) = progress {
                    progress(1.0);
                }
                let responses = self.responses.lock().expect("script lock");
                let response = responses
                    .get(index)
                    .or_else(|| responses.last())
                    .cloned()
                    .expect("script should not be empty");
                Ok(response)
            })
        }
    }

    struct Recorder {
        outcomes: Mutex<Vec<Result<Bytes>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(Vec::new()),
            })
        }

        fn completion(self: &Arc<Self>) -> Completion {
            let recorder = Arc::clone(self);
            Arc::new(move |outcome| recorder.outcomes.lock().expect("recorder lock").push(outcome))
        }

        fn outcomes(&self) -> Vec<Result<Bytes>> {
            self.outcomes.lock().expect("recorder lock").clone()
        }
    }

    fn pipeline(
        transport: Arc<dyn Transport>,
        request_adapters: RequestAdapterChain,
        retry_funnel: RetryFunnel,
        max_retries: usize,
    ) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            transport,
            request_adapters,
            response_adapters: ResponseAdapterChain::default(),
            retry_funnel,
            max_retries,
            metrics: None,
        })
    }

    fn execution(pipeline: Arc<Pipeline>, completion: Completion) -> TaskExecution {
        let request = Request::get("https://api.example.com/api/v1/employees")
            .build()
            .expect("request should build");
        TaskExecution::new(
            1,
            request,
            TaskKind::Data,
            None,
            completion,
            pipeline,
            CancellationToken::new(),
        )
    }

    fn always_retry(calls: &Arc<AtomicUsize>) -> RetryFunnel {
        let calls = Arc::clone(calls);
        RetryFunnel::new(vec![retrier_fn(move |_error, _attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                RetryPlan::RetryNow
            }
        })])
    }

    #[tokio::test]
    async fn retry_ceiling_bounds_an_always_retrying_funnel() {
        let transport = ScriptedTransport::new(vec![TransportResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "busy",
        )]);
        let consults = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder::new();
        let task = execution(
            pipeline(
                transport.clone(),
                RequestAdapterChain::default(),
                always_retry(&consults),
                3,
            ),
            recorder.completion(),
        );

        task.run().await;

        assert_eq!(consults.load(Ordering::SeqCst), 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        let error = outcomes[0].clone().expect_err("final attempt should fail");
        assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(task.state(), ExecutionState::Finished);
    }

    #[tokio::test]
    async fn zero_max_retries_never_consults_the_funnel() {
        let transport = ScriptedTransport::new(vec![TransportResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
        )]);
        let consults = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder::new();
        let task = execution(
            pipeline(
                transport,
                RequestAdapterChain::default(),
                always_retry(&consults),
                0,
            ),
            recorder.completion(),
        );

        task.run().await;
        assert_eq!(consults.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn request_adapter_failure_is_delivered_without_retry() {
        let transport = ScriptedTransport::new(vec![TransportResponse::new(StatusCode::OK, "[]")]);
        let consults = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder::new();
        let adapters = RequestAdapterChain::new(vec![request_adapter_fn(|_request| async {
            Err(Error::rejected(AdapterStage::Request, "no credentials"))
        })]);
        let task = execution(
            pipeline(transport.clone(), adapters, always_retry(&consults), 3),
            recorder.completion(),
        );

        task.run().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(consults.load(Ordering::SeqCst), 0);
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            Err(Error::AdapterRejected {
                stage: AdapterStage::Request,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn retry_restarts_from_the_original_request() {
        let transport = ScriptedTransport::new(vec![
            TransportResponse::new(StatusCode::BAD_GATEWAY, "retry"),
            TransportResponse::new(StatusCode::OK, "done"),
        ]);
        let seen_headers = Arc::new(Mutex::new(Vec::new()));
        let seen_for_adapter = Arc::clone(&seen_headers);
        let adapters = RequestAdapterChain::new(vec![request_adapter_fn(move |request: Request| {
            let seen = Arc::clone(&seen_for_adapter);
            async move {
                seen.lock()
                    .expect("seen lock")
                    .push(request.headers().get_all("x-attempt").iter().count());
                request.try_with_header("x-attempt", "adapted")
            }
        })]);
        let recorder = Recorder::new();
        let consults = Arc::new(AtomicUsize::new(0));
        let task = execution(
            pipeline(transport, adapters, always_retry(&consults), 1),
            recorder.completion(),
        );

        task.run().await;
        assert_eq!(*seen_headers.lock().expect("seen lock"), vec![0, 0]);
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].clone().expect("second attempt should succeed"),
            Bytes::from_static(b"done")
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let transport = ScriptedTransport::new(vec![TransportResponse::new(StatusCode::OK, "[]")]);
        let adapter_calls = Arc::new(AtomicUsize::new(0));
        let adapter_calls_for_adapter = Arc::clone(&adapter_calls);
        let adapters = RequestAdapterChain::new(vec![request_adapter_fn(move |request| {
            let calls = Arc::clone(&adapter_calls_for_adapter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(request)
            }
        })]);
        let recorder = Recorder::new();
        let task = execution(
            pipeline(transport.clone(), adapters, RetryFunnel::default(), 1),
            recorder.completion(),
        );

        assert!(task.cancel());
        assert!(!task.cancel());
        task.run().await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(adapter_calls.load(Ordering::SeqCst), 0);
        assert!(recorder.outcomes().is_empty());
        assert_eq!(task.state(), ExecutionState::Finished);
    }

    #[tokio::test]
    async fn cancel_during_adaptation_suppresses_delivery() {
        let transport = ScriptedTransport::new(vec![TransportResponse::new(StatusCode::OK, "[]")]);
        let adapters = RequestAdapterChain::new(vec![request_adapter_fn(|request| async move {
            std::future::pending::<()>().await;
            Ok(request)
        })]);
        let recorder = Recorder::new();
        let task = Arc::new(execution(
            pipeline(transport.clone(), adapters, RetryFunnel::default(), 1),
            recorder.completion(),
        ));

        let running = tokio::spawn({
            let task = Arc::clone(&task);
            async move { task.run().await }
        });
        while task.state() != ExecutionState::Executing {
            tokio::task::yield_now().await;
        }
        assert!(task.cancel());
        running.await.expect("task should join");

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(recorder.outcomes().is_empty());
    }

    #[tokio::test]
    async fn two_hundred_without_body_delivers_empty_bytes() {
        let transport = ScriptedTransport::new(vec![TransportResponse {
            status: StatusCode::NO_CONTENT,
            headers: http::HeaderMap::new(),
            body: None,
        }]);
        let recorder = Recorder::new();
        let task = execution(
            pipeline(
                transport,
                RequestAdapterChain::default(),
                RetryFunnel::default(),
                1,
            ),
            recorder.completion(),
        );

        task.run().await;
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().is_ok_and(Bytes::is_empty));
    }
}
