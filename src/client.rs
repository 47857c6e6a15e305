use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::Result;
use crate::adapter::{RequestAdapter, RequestAdapterChain, ResponseAdapter, ResponseAdapterChain};
use crate::cache::{CacheStorageProvider, CachedService};
use crate::error::Error;
use crate::execution::{Completion, Pipeline, TaskExecution};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::request::{Request, TaskKind};
use crate::retry::{Retrier, RetryFunnel};
use crate::scheduler::{DEFAULT_MAX_CONCURRENT_TASKS, Scheduler, TaskHandle};
use crate::tls::ServerTrustConfiguration;
use crate::transport::{HttpTransport, ProgressHandler, Transport, TransportConfig};
use crate::util::{lock_unpoisoned, redact_uri_for_logs, truncate_body};

const DEFAULT_CLIENT_NAME: &str = "reqflow";
const DEFAULT_MAX_RETRIES: usize = 1;

/// Anything that accepts tasks and reports their outcome through a
/// [`Completion`].
pub trait NetworkService: Send + Sync {
    /// Queues the task and returns at once.
    fn submit(
        &self,
        request: Request,
        kind: TaskKind,
        progress: Option<ProgressHandler>,
        completion: Completion,
    ) -> TaskHandle;
}

pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    request_adapters: Vec<Arc<dyn RequestAdapter>>,
    response_adapters: Vec<Arc<dyn ResponseAdapter>>,
    retriers: Vec<Arc<dyn Retrier>>,
    max_retries: usize,
    max_concurrent_tasks: usize,
    server_trust: Option<ServerTrustConfiguration>,
    runtime: Option<Handle>,
    metrics_enabled: bool,
    client_name: String,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            transport: None,
            transport_config: TransportConfig::default(),
            request_adapters: Vec::new(),
            response_adapters: Vec::new(),
            retriers: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            server_trust: None,
            runtime: None,
            metrics_enabled: false,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    /// Replaces the default [`HttpTransport`].
    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Ignored when a custom transport is set.
    pub fn transport_config(mut self, transport_config: TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    pub fn request_adapter<A>(self, adapter: A) -> Self
    where
        A: RequestAdapter + 'static,
    {
        self.request_adapter_arc(Arc::new(adapter))
    }

    pub fn request_adapter_arc(mut self, adapter: Arc<dyn RequestAdapter>) -> Self {
        self.request_adapters.push(adapter);
        self
    }

    pub fn request_adapters(
        mut self,
        adapters: impl IntoIterator<Item = Arc<dyn RequestAdapter>>,
    ) -> Self {
        self.request_adapters.extend(adapters);
        self
    }

    pub fn response_adapter<A>(self, adapter: A) -> Self
    where
        A: ResponseAdapter + 'static,
    {
        self.response_adapter_arc(Arc::new(adapter))
    }

    pub fn response_adapter_arc(mut self, adapter: Arc<dyn ResponseAdapter>) -> Self {
        self.response_adapters.push(adapter);
        self
    }

    pub fn response_adapters(
        mut self,
        adapters: impl IntoIterator<Item = Arc<dyn ResponseAdapter>>,
    ) -> Self {
        self.response_adapters.extend(adapters);
        self
    }

    pub fn retrier<R>(self, retrier: R) -> Self
    where
        R: Retrier + 'static,
    {
        self.retrier_arc(Arc::new(retrier))
    }

    pub fn retrier_arc(mut self, retrier: Arc<dyn Retrier>) -> Self {
        self.retriers.push(retrier);
        self
    }

    pub fn retriers(mut self, retriers: impl IntoIterator<Item = Arc<dyn Retrier>>) -> Self {
        self.retriers.extend(retriers);
        self
    }

    /// Hard ceiling on retries per task, whatever the retriers vote.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks.max(1);
        self
    }

    pub fn server_trust(mut self, server_trust: ServerTrustConfiguration) -> Self {
        self.server_trust = Some(server_trust);
        self
    }

    /// Runtime that runs the tasks. Defaults to the runtime `try_build` is
    /// called on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?,
        };

        let transport = match self.transport {
            Some(transport) => {
                if self.server_trust.is_some() {
                    warn!(
                        client = %self.client_name,
                        "server trust configuration is ignored by custom transports"
                    );
                }
                transport
            }
            None => Arc::new(HttpTransport::with_server_trust(
                self.transport_config,
                self.server_trust.as_ref(),
            )?) as Arc<dyn Transport>,
        };

        let metrics = self.metrics_enabled.then(ClientMetrics::default);
        let pipeline = Pipeline {
            transport,
            request_adapters: RequestAdapterChain::new(self.request_adapters),
            response_adapters: ResponseAdapterChain::new(self.response_adapters),
            retry_funnel: RetryFunnel::new(self.retriers),
            max_retries: self.max_retries,
            metrics: metrics.clone(),
        };
        let scheduler = Scheduler::new(runtime.clone(), self.max_concurrent_tasks);

        Ok(Client {
            inner: Arc::new(ClientInner {
                client_name: self.client_name,
                pipeline: Arc::new(pipeline),
                scheduler,
                runtime,
                metrics,
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the pipeline. Cheap to clone; clones share one scheduler.
///
/// Dropping the last clone cancels every task that has not finished.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_name: String,
    pipeline: Arc<Pipeline>,
    scheduler: Scheduler,
    runtime: Handle,
    metrics: Option<ClientMetrics>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub async fn send(&self, request: Request) -> Result<Bytes> {
        self.send_task(request, TaskKind::Data).await
    }

    pub async fn send_task(&self, request: Request, kind: TaskKind) -> Result<Bytes> {
        self.send_task_with_progress(request, kind, None).await
    }

    /// Dropping the returned future cancels the task.
    pub async fn send_task_with_progress(
        &self,
        request: Request,
        kind: TaskKind,
        progress: Option<ProgressHandler>,
    ) -> Result<Bytes> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let completion: Completion = Arc::new(move |outcome| {
            if let Some(sender) = lock_unpoisoned(&sender).take() {
                let _ = sender.send(outcome);
            }
        });
        let _guard = CancelOnDrop(self.submit(request, kind, progress, completion));
        receiver.await.unwrap_or(Err(Error::Cancelled))
    }

    pub async fn send_json<T>(&self, request: Request) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.send(request).await?;
        serde_json::from_slice(&body).map_err(|source| Error::Decode {
            source: Arc::new(source),
            body: truncate_body(&body),
        })
    }

    /// Tasks submitted or queued while suspended wait until [`Client::resume`].
    /// Tasks already executing are not interrupted.
    pub fn suspend(&self) {
        self.inner.scheduler.suspend();
    }

    pub fn resume(&self) {
        self.inner.scheduler.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.scheduler.is_suspended()
    }

    /// All zeros unless the client was built with `metrics_enabled(true)`.
    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner
            .metrics
            .as_ref()
            .map(ClientMetrics::snapshot)
            .unwrap_or_default()
    }

    /// Wraps this client in a read-through cache. See [`CachedService`] for
    /// the double-completion contract.
    pub fn with_cache_storage<P>(&self, provider: P) -> CachedService<Client>
    where
        P: CacheStorageProvider + 'static,
    {
        CachedService::new(self.clone(), Arc::new(provider), self.inner.runtime.clone())
    }
}

impl NetworkService for Client {
    fn submit(
        &self,
        request: Request,
        kind: TaskKind,
        progress: Option<ProgressHandler>,
        completion: Completion,
    ) -> TaskHandle {
        let scheduler = &self.inner.scheduler;
        let task_id = scheduler.next_task_id();
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_task_submitted();
        }
        debug!(
            client = %self.inner.client_name,
            task_id,
            method = %request.method(),
            uri = %redact_uri_for_logs(request.url()),
            kind = kind.as_str(),
            "task submitted"
        );
        let execution = TaskExecution::new(
            task_id,
            request,
            kind,
            progress,
            completion,
            Arc::clone(&self.inner.pipeline),
            scheduler.task_token(),
        );
        scheduler.submit(execution)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .field("max_retries", &self.inner.pipeline.max_retries)
            .field("suspended", &self.is_suspended())
            .field("metrics_enabled", &self.inner.metrics.is_some())
            .finish()
    }
}

struct CancelOnDrop(TaskHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::{Client, DEFAULT_MAX_RETRIES};
    use crate::error::Error;
    use crate::scheduler::DEFAULT_MAX_CONCURRENT_TASKS;

    #[test]
    fn try_build_without_runtime_reports_runtime_unavailable() {
        let error = Client::builder()
            .try_build()
            .expect_err("no runtime is running");
        assert!(matches!(error, Error::RuntimeUnavailable));
    }

    #[test]
    fn builder_defaults_match_documented_values() {
        let builder = Client::builder();
        assert_eq!(builder.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(builder.max_concurrent_tasks, DEFAULT_MAX_CONCURRENT_TASKS);
        assert!(!builder.metrics_enabled);
        assert_eq!(builder.client_name, "reqflow");
    }

    #[tokio::test]
    async fn default_client_builds_inside_a_runtime() {
        let client = Client::builder()
            .client_name("employees-sdk")
            .try_build()
            .expect("client should build");
        assert_eq!(client.client_name(), "employees-sdk");
        assert!(!client.is_suspended());
        client.suspend();
        assert!(client.is_suspended());
        client.resume();
        assert!(!client.is_suspended());
    }
}
