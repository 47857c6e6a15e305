use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use http::{HeaderMap, Method, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ProgressHandler, Transport, TransportConfig, TransportResponse};
use crate::Result;
use crate::error::{Error, TransportErrorKind};
use crate::request::{DestinationResolver, Request, TaskKind};
use crate::tls::{ServerTrustConfiguration, build_rustls_tls_config};
use crate::util::{classify_transport_error, merge_headers, redact_uri_for_logs};

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default [`Transport`] over hyper with rustls.
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpsClient,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_server_trust(config, None)
    }

    pub fn with_server_trust(
        config: TransportConfig,
        server_trust: Option<&ServerTrustConfiguration>,
    ) -> Result<Self> {
        let tls_config = build_rustls_tls_config(server_trust)?;
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(config.connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(config.http2_only)
            .build(https);
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn exchange(
        &self,
        request: &Request,
        kind: &TaskKind,
        progress: Option<&ProgressHandler>,
    ) -> Result<TransportResponse> {
        let method = request.method().clone();
        let redacted_uri = redact_uri_for_logs(request.url());
        let uri: Uri = request.url().parse().map_err(|_| Error::InvalidUri {
            uri: redacted_uri.clone(),
        })?;

        let body = match kind {
            TaskKind::UploadData(bytes) => bytes.clone(),
            TaskKind::UploadFile(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|source| io_error(&method, &redacted_uri, source))?,
            TaskKind::Data | TaskKind::Download(_) => {
                request.body().cloned().unwrap_or_default()
            }
        };

        let mut builder = http::Request::builder().method(method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = merge_headers(&self.config.default_headers, request.headers());
        }
        let http_request = builder
            .body(Full::new(body))
            .map_err(|source| Error::RequestBuild {
                message: source.to_string(),
            })?;

        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|source| Error::Transport {
                kind: classify_transport_error(&source),
                method: method.clone(),
                uri: redacted_uri.clone(),
                source: Arc::new(source),
            })?;
        let (parts, incoming) = response.into_parts();
        let expected_len = content_length(&parts.headers);

        let body = match kind {
            TaskKind::Download(resolver) if parts.status.is_success() => {
                let destination =
                    resolve_destination(resolver, &parts.headers, request.url());
                debug!(path = %destination.display(), "streaming download to disk");
                write_download(incoming, &destination, expected_len, progress, &method, &redacted_uri)
                    .await?;
                Bytes::from(destination.to_string_lossy().into_owned())
            }
            _ => {
                let limit = self.config.max_response_body_bytes;
                read_body(incoming, expected_len, limit, progress, &method, &redacted_uri).await?
            }
        };

        if parts.status.is_success()
            && let Some(progress) = progress
        {
            progress(1.0);
        }

        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            body: Some(body),
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a self,
        request: &'a Request,
        kind: &'a TaskKind,
        progress: Option<ProgressHandler>,
    ) -> BoxFuture<'a, Result<TransportResponse>> {
        Box::pin(async move {
            let timeout = self.config.request_timeout;
            match tokio::time::timeout(timeout, self.exchange(request, kind, progress.as_ref()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                }),
            }
        })
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|length| *length > 0)
}

fn report_progress(progress: Option<&ProgressHandler>, received: u64, expected_len: Option<u64>) {
    if let (Some(progress), Some(expected_len)) = (progress, expected_len) {
        progress((received as f64 / expected_len as f64).min(1.0));
    }
}

async fn read_body(
    mut incoming: Incoming,
    expected_len: Option<u64>,
    max_bytes: usize,
    progress: Option<&ProgressHandler>,
    method: &Method,
    uri: &str,
) -> Result<Bytes> {
    let too_large = |actual_bytes: usize| Error::ResponseBodyTooLarge {
        limit_bytes: max_bytes,
        actual_bytes,
        method: method.clone(),
        uri: uri.to_owned(),
    };
    if let Some(expected_len) = expected_len
        && expected_len > max_bytes as u64
    {
        return Err(too_large(usize::try_from(expected_len).unwrap_or(usize::MAX)));
    }

    let mut collected = BytesMut::new();
    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(|source| read_error(method, uri, source))?;
        if let Ok(data) = frame.into_data() {
            let actual_bytes = collected.len().saturating_add(data.len());
            if actual_bytes > max_bytes {
                return Err(too_large(actual_bytes));
            }
            collected.extend_from_slice(&data);
            report_progress(progress, collected.len() as u64, expected_len);
        }
    }
    Ok(collected.freeze())
}

async fn write_download(
    mut incoming: Incoming,
    destination: &Path,
    expected_len: Option<u64>,
    progress: Option<&ProgressHandler>,
    method: &Method,
    uri: &str,
) -> Result<()> {
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| io_error(method, uri, source))?;
    }
    let mut file = tokio::fs::File::create(destination)
        .await
        .map_err(|source| io_error(method, uri, source))?;

    let mut received = 0_u64;
    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(|source| read_error(method, uri, source))?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data)
                .await
                .map_err(|source| io_error(method, uri, source))?;
            received += data.len() as u64;
            report_progress(progress, received, expected_len);
        }
    }
    file.flush()
        .await
        .map_err(|source| io_error(method, uri, source))
}

fn resolve_destination(resolver: &DestinationResolver, headers: &HeaderMap, url: &str) -> PathBuf {
    let suggested = suggested_filename(headers, url);
    resolver(suggested.as_deref()).unwrap_or_else(|| {
        let file_name = suggested.unwrap_or_else(|| "download".to_owned());
        std::env::temp_dir().join(file_name)
    })
}

pub(crate) fn suggested_filename(headers: &HeaderMap, url: &str) -> Option<String> {
    let from_disposition = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .split(';')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("filename="))
                .map(|name| name.trim_matches('"').to_owned())
        });
    let candidate = from_disposition.or_else(|| {
        let parsed = url::Url::parse(url).ok()?;
        let last = parsed.path_segments()?.next_back()?;
        Some(last.to_owned())
    })?;

    Path::new(&candidate)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

fn read_error(method: &Method, uri: &str, source: hyper::Error) -> Error {
    Error::Transport {
        kind: TransportErrorKind::Read,
        method: method.clone(),
        uri: uri.to_owned(),
        source: Arc::new(source),
    }
}

fn io_error(method: &Method, uri: &str, source: std::io::Error) -> Error {
    Error::Transport {
        kind: TransportErrorKind::Io,
        method: method.clone(),
        uri: uri.to_owned(),
        source: Arc::new(source),
    }
}

#[cfg(test)]
mod tests {
    use http::header::CONTENT_DISPOSITION;
    use http::{HeaderMap, HeaderValue};

    use super::suggested_filename;

    #[test]
    fn suggested_filename_prefers_content_disposition() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"report.csv\""),
        );
        assert_eq!(
            suggested_filename(&headers, "https://files.example.com/download?id=7").as_deref(),
            Some("report.csv")
        );
    }

    #[test]
    fn suggested_filename_falls_back_to_last_path_segment() {
        assert_eq!(
            suggested_filename(&HeaderMap::new(), "https://files.example.com/a/b/photo.png")
                .as_deref(),
            Some("photo.png")
        );
        assert_eq!(
            suggested_filename(&HeaderMap::new(), "https://files.example.com/"),
            None
        );
    }

    #[test]
    fn suggested_filename_strips_directories() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"../../etc/passwd\""),
        );
        assert_eq!(
            suggested_filename(&headers, "https://files.example.com/x").as_deref(),
            Some("passwd")
        );
    }
}
