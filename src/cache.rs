use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::Result;
use crate::client::NetworkService;
use crate::error::{Error, ErrorCode};
use crate::execution::Completion;
use crate::request::{Request, TaskKind};
use crate::scheduler::TaskHandle;
use crate::transport::ProgressHandler;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

const DEFAULT_CACHE_SPACE: &str = "reqflow-caches";

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One cached payload.
///
/// `read` fails with [`Error::CacheMiss`] when nothing is stored.
pub trait CacheStorage: Send + Sync {
    fn read(&self) -> Result<Bytes>;

    /// `None` empties the entry.
    fn write(&self, data: Option<Bytes>) -> Result<()>;
}

/// Picks the storage for a request, or `None` to skip caching it.
pub trait CacheStorageProvider: Send + Sync {
    fn cache_storage(&self, request: &Request) -> Option<Arc<dyn CacheStorage>>;
}

pub type CachePredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Stores a payload in a single file.
#[derive(Clone, Debug)]
pub struct FileCacheStorage {
    path: PathBuf,
}

impl FileCacheStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> Error {
        Error::CacheIo {
            path: path.display().to_string(),
            source: Arc::new(source),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let nonce = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "entry".to_owned());
        self.path
            .with_file_name(format!(".{file_name}.{}.{nonce}.tmp", std::process::id()))
    }
}

impl CacheStorage for FileCacheStorage {
    fn read(&self) -> Result<Bytes> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(source) if source.kind() == ErrorKind::NotFound => Err(Error::CacheMiss),
            Err(source) => Err(self.io_error(&self.path, source)),
        }
    }

    fn write(&self, data: Option<Bytes>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(parent, source))?;
        }
        let temp_path = self.temp_path();
        let data = data.unwrap_or_default();
        std::fs::write(&temp_path, &data).map_err(|source| self.io_error(&temp_path, source))?;
        if let Err(source) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(self.io_error(&self.path, source));
        }
        Ok(())
    }
}

/// One file per request fingerprint under a root directory.
#[derive(Clone)]
pub struct FileCacheStorageProvider {
    root: PathBuf,
    predicate: Option<CachePredicate>,
}

impl FileCacheStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            predicate: None,
        }
    }

    /// `<system temp dir>/reqflow-caches`.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join(DEFAULT_CACHE_SPACE))
    }

    /// Only requests accepted by `predicate` are cached.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for FileCacheStorageProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("FileCacheStorageProvider")
            .field("root", &self.root)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl CacheStorageProvider for FileCacheStorageProvider {
    fn cache_storage(&self, request: &Request) -> Option<Arc<dyn CacheStorage>> {
        if !accepts(self.predicate.as_ref(), request) {
            return None;
        }
        Some(Arc::new(FileCacheStorage::new(
            self.root.join(request.fingerprint()),
        )))
    }
}

type MemoryEntries = Arc<Mutex<HashMap<String, Bytes>>>;

/// Process-local storage keyed by request fingerprint.
#[derive(Clone, Default)]
pub struct MemoryCacheStorageProvider {
    entries: MemoryEntries,
    predicate: Option<CachePredicate>,
}

impl MemoryCacheStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}

impl std::fmt::Debug for MemoryCacheStorageProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MemoryCacheStorageProvider")
            .field("entries", &self.len())
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl CacheStorageProvider for MemoryCacheStorageProvider {
    fn cache_storage(&self, request: &Request) -> Option<Arc<dyn CacheStorage>> {
        if !accepts(self.predicate.as_ref(), request) {
            return None;
        }
        Some(Arc::new(MemoryCacheStorage {
            entries: Arc::clone(&self.entries),
            key: request.fingerprint(),
        }))
    }
}

struct MemoryCacheStorage {
    entries: MemoryEntries,
    key: String,
}

impl CacheStorage for MemoryCacheStorage {
    fn read(&self) -> Result<Bytes> {
        lock_unpoisoned(&self.entries)
            .get(&self.key)
            .cloned()
            .ok_or(Error::CacheMiss)
    }

    fn write(&self, data: Option<Bytes>) -> Result<()> {
        let mut entries = lock_unpoisoned(&self.entries);
        match data {
            Some(data) => {
                entries.insert(self.key.clone(), data);
            }
            None => {
                entries.remove(&self.key);
            }
        }
        Ok(())
    }
}

fn accepts(predicate: Option<&CachePredicate>, request: &Request) -> bool {
    match predicate {
        Some(predicate) => {
            let accepted = predicate(request);
            if !accepted {
                debug!(uri = %redact_uri_for_logs(request.url()), "cache disabled for request");
            }
            accepted
        }
        None => true,
    }
}

/// Read-through cache in front of a [`NetworkService`].
///
/// A submitted task may complete twice: once with the cached payload and
/// once with the fresh network result, in either order. Callers that need a
/// single completion should submit to the wrapped service directly.
pub struct CachedService<S> {
    inner: S,
    provider: Arc<dyn CacheStorageProvider>,
    runtime: Handle,
}

impl<S> CachedService<S>
where
    S: NetworkService,
{
    pub fn new(inner: S, provider: Arc<dyn CacheStorageProvider>, runtime: Handle) -> Self {
        Self {
            inner,
            provider,
            runtime,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for CachedService<S> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("CachedService").finish_non_exhaustive()
    }
}

impl<S> NetworkService for CachedService<S>
where
    S: NetworkService,
{
    fn submit(
        &self,
        request: Request,
        kind: TaskKind,
        progress: Option<ProgressHandler>,
        completion: Completion,
    ) -> TaskHandle {
        let Some(storage) = self.provider.cache_storage(&request) else {
            return self.inner.submit(request, kind, progress, completion);
        };
        let uri = redact_uri_for_logs(request.url());

        let write_storage = Arc::clone(&storage);
        let write_runtime = self.runtime.clone();
        let write_uri = uri.clone();
        let forward = Arc::clone(&completion);
        let refreshing: Completion = Arc::new(move |outcome: Result<Bytes>| {
            if let Ok(data) = &outcome {
                let storage = Arc::clone(&write_storage);
                let data = data.clone();
                let uri = write_uri.clone();
                write_runtime.spawn_blocking(move || match storage.write(Some(data)) {
                    Ok(()) => debug!(uri = %uri, "cache entry saved"),
                    Err(error) => warn!(uri = %uri, error = %error, "cache write failed; response not saved"),
                });
            }
            forward(outcome);
        });

        self.runtime.spawn_blocking(move || match storage.read() {
            Ok(data) if data.is_empty() => debug!(uri = %uri, "cache entry empty"),
            Ok(data) => {
                debug!(uri = %uri, bytes = data.len(), "cache hit");
                completion(Ok(data));
            }
            Err(error) if error.code() == ErrorCode::CacheMiss => {
                debug!(uri = %uri, "cache miss");
            }
            Err(error) => warn!(uri = %uri, error = %error, "cache read failed; fetching from remote"),
        });

        self.inner.submit(request, kind, progress, refreshing)
    }
}
