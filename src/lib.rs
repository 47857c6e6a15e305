//! `reqflow` is an embeddable HTTP client pipeline: request adapters, a
//! pluggable transport, response adapters and a retry funnel, run as
//! cancellable tasks on a bounded scheduler.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Authorization, BackoffRetrier, Client, Request};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Employee {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .client_name("employees-sdk")
//!         .retrier(BackoffRetrier::standard().max_backoff(Duration::from_millis(800)))
//!         .max_retries(2)
//!         .try_build()?;
//!
//!     let request = Request::get("https://api.example.com/api/v1/employees")
//!         .authorization(Authorization::Bearer("secret-token".to_owned()))?
//!         .build()?;
//!     let employees: Vec<Employee> = client.send_json(request).await?;
//!
//!     println!("fetched {} employees", employees.len());
//!     Ok(())
//! }
//! ```
//!
//! # Delivery Contract
//!
//! - Every task submitted to a [`Client`] completes at most once.
//! - A cancelled task never completes.
//! - [`CachedService`] may complete a task twice: cached bytes, then fresh ones.

mod adapter;
mod barrier;
mod cache;
mod client;
mod continuation;
mod error;
mod execution;
mod metrics;
mod request;
mod retry;
mod scheduler;
mod tls;
mod transport;
mod util;

pub use crate::adapter::{
    CallbackRequestAdapter, CallbackResponseAdapter, DefaultHeadersAdapter, RequestAdapter,
    RequestAdapterChain, RequestAdapterFn, ResponseAdapter, ResponseAdapterChain,
    ResponseAdapterFn, request_adapter_fn, response_adapter_fn,
};
pub use crate::barrier::{
    CallBarrier, KeyedCallBarrier, RequestAdapterBarrier, ResponseAdapterBarrier, RetryBarrier,
    WithBarrier,
};
pub use crate::cache::{
    CachePredicate, CacheStorage, CacheStorageProvider, CachedService, FileCacheStorage,
    FileCacheStorageProvider, MemoryCacheStorageProvider,
};
pub use crate::client::{Client, ClientBuilder, NetworkService};
pub use crate::continuation::{Continuation, Pending, continuation};
pub use crate::error::{AdapterStage, Error, ErrorCode, TransportErrorKind};
pub use crate::execution::{Completion, ExecutionState};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::request::{
    Authorization, DestinationResolver, Request, RequestBuilder, TaskKind,
};
pub use crate::retry::{
    BackoffRetrier, NoRetrier, Retrier, RetrierFn, RetryClassifier, RetryFunnel, RetryPlan,
    retrier_fn,
};
pub use crate::scheduler::TaskHandle;
pub use crate::tls::{
    PinnedCertificate, PinnedCertificateDigest, ServerTrust, ServerTrustConfiguration,
    TrustEvaluator,
};
pub use crate::transport::{
    HttpTransport, ProgressHandler, Transport, TransportConfig, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Authorization, BackoffRetrier, Client, ClientBuilder, ClientMetricsSnapshot, Completion,
        Error, ErrorCode, ExecutionState, NetworkService, ProgressHandler, Request,
        RequestAdapter, ResponseAdapter, Result, Retrier, RetryPlan, TaskHandle, TaskKind,
        Transport, TransportConfig, TransportErrorKind, WithBarrier,
    };
}
