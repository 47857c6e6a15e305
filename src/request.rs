use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;

use crate::Result;
use crate::error::Error;
use crate::util::{merge_headers, parse_header_name, parse_header_value, sha256_hex};

/// An outgoing HTTP request.
///
/// Requests are values: adapters receive one and hand back a new one through
/// the `with_*` methods instead of mutating shared state.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url.into())
    }

    pub fn get(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::DELETE, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        validate_url(&url)?;
        self.url = url;
        Ok(self)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        self.headers = merge_headers(&self.headers, headers);
        self
    }

    pub fn without_header(mut self, name: &HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }

    /// Stable cache key: SHA-256 hex digest of the canonical URL.
    pub fn fingerprint(&self) -> String {
        let canonical = url::Url::parse(&self.url)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| self.url.clone());
        sha256_hex(canonical.as_bytes())
    }

    /// Identity used to tell whether two in-flight requests are the same.
    pub(crate) fn barrier_key(&self) -> RequestKey {
        let mut headers: Vec<(String, Vec<u8>)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
            .collect();
        headers.sort();
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
        }
    }

    pub fn to_curl(&self, pretty: bool) -> String {
        let mut parts = Vec::new();
        if pretty {
            parts.push(format!("curl --request {}", self.method));
            parts.push(format!("--url '{}'", self.url));
        } else {
            parts.push(format!("curl -X {}", self.method));
            parts.push(format!("'{}'", self.url));
        }

        let header_flag = if pretty { "--header" } else { "-H" };
        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes());
            parts.push(format!("{header_flag} '{name}: {value}'"));
        }

        if let Some(body) = &self.body
            && let Ok(text) = std::str::from_utf8(body)
            && !text.is_empty()
        {
            parts.push(format!("--data '{text}'"));
        }

        let separator = if pretty { " \\\n" } else { " " };
        parts.join(separator)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RequestKey {
    method: Method,
    url: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorization {
    Bearer(String),
    Basic(String),
    Raw(String),
    None,
}

impl Authorization {
    pub fn token(&self) -> Option<String> {
        match self {
            Self::Bearer(token) => Some(prefix_if_needed("Bearer", token)),
            Self::Basic(token) => Some(prefix_if_needed("Basic", token)),
            Self::Raw(token) => Some(token.clone()),
            Self::None => None,
        }
    }
}

fn prefix_if_needed(prefix: &str, token: &str) -> String {
    if token.starts_with(prefix) {
        token.to_owned()
    } else {
        format!("{prefix} {token}")
    }
}

pub struct RequestBuilder {
    method: Method,
    url: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestBuilder {
    fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        self.headers = merge_headers(&self.headers, headers);
        self
    }

    pub fn authorization(self, authorization: Authorization) -> Result<Self> {
        match authorization.token() {
            Some(token) => {
                let value = parse_header_value(AUTHORIZATION.as_str(), &token)?;
                Ok(self.header(AUTHORIZATION, value))
            }
            None => Ok(self),
        }
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(mut self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        self.body = Some(Bytes::from(body));
        Ok(self.header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(mut self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_urlencoded::to_string(value).map_err(|source| Error::SerializeForm {
            source: Arc::new(source),
        })?;
        self.body = Some(Bytes::from(body));
        Ok(self.header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    pub fn build(self) -> Result<Request> {
        let url = if self.query_pairs.is_empty() {
            self.url
        } else {
            append_query_pairs(&self.url, &self.query_pairs)?
        };
        validate_url(&url)?;
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}

fn append_query_pairs(url: &str, query_pairs: &[(String, String)]) -> Result<String> {
    let mut parsed = url::Url::parse(url).map_err(|_| Error::InvalidUri {
        uri: url.to_owned(),
    })?;
    parsed
        .query_pairs_mut()
        .extend_pairs(query_pairs.iter().map(|(name, value)| (name, value)));
    Ok(parsed.to_string())
}

fn validate_url(url: &str) -> Result<()> {
    let invalid = || Error::InvalidUri {
        uri: url.to_owned(),
    };
    let uri: Uri = url.parse().map_err(|_| invalid())?;
    let scheme_ok = uri
        .scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"));
    if !scheme_ok || uri.host().is_none() {
        return Err(invalid());
    }
    Ok(())
}

/// Maps the server-suggested file name to the final download location.
pub type DestinationResolver = Arc<dyn Fn(Option<&str>) -> Option<PathBuf> + Send + Sync>;

/// What the transport should do with a request. The pipeline passes it
/// through untouched.
#[derive(Clone, Default)]
pub enum TaskKind {
    #[default]
    Data,
    UploadData(Bytes),
    UploadFile(PathBuf),
    Download(DestinationResolver),
}

impl TaskKind {
    pub fn download_to(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self::Download(Arc::new(move |_| Some(path.clone())))
    }

    pub fn download_with<F>(resolver: F) -> Self
    where
        F: Fn(Option<&str>) -> Option<PathBuf> + Send + Sync + 'static,
    {
        Self::Download(Arc::new(resolver))
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::UploadData(_) => "upload_data",
            Self::UploadFile(_) => "upload_file",
            Self::Download(_) => "download",
        }
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => formatter.write_str("Data"),
            Self::UploadData(bytes) => formatter
                .debug_tuple("UploadData")
                .field(&bytes.len())
                .finish(),
            Self::UploadFile(path) => formatter.debug_tuple("UploadFile").field(path).finish(),
            Self::Download(_) => formatter.write_str("Download(..)"),
        }
    }
}
