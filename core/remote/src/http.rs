//! HTTP client for the remote document store.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use docmirror_common::{CollectionId, Cursor, Error, ItemId, Result};

use crate::client::{clamp_page_size, CollectionSchema, ItemPatch, Page, RemoteClient, RemoteItem};
use crate::rate_limit::RateLimiter;

/// Connection settings for [`HttpRemote`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// Base URL of the remote API, e.g. `https://api.example.com/v1/`.
    pub base_url: String,
    /// Page size requested when listing collections.
    pub page_size: usize,
    /// Minimum spacing between two calls, in milliseconds.
    pub min_call_spacing_ms: u64,
    /// Hard timeout for one HTTP request, in seconds.
    pub request_timeout_secs: u64,
}

impl HttpRemoteConfig {
    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1/".to_string(),
            page_size: 100,
            min_call_spacing_ms: 350,
            request_timeout_secs: 30,
        }
    }
}

/// Error body returned by the remote API.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`RemoteClient`].
pub struct HttpRemote {
    http: Client,
    base: Url,
    token: String,
    timeout: Duration,
    limiter: RateLimiter,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    ///
    /// # Errors
    /// - Base URL cannot be parsed
    /// - HTTP client cannot be constructed
    pub fn new(config: &HttpRemoteConfig, token: impl Into<String>) -> Result<Self> {
        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base = Url::parse(&base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent(concat!("docmirror/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: token.into(),
            timeout: config.request_timeout(),
            limiter: RateLimiter::new(config.min_call_spacing()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// Send a request after waiting for a rate-limit slot.
    async fn send<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.limiter.acquire().await;

        let response = request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        self.handle_response(response).await
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Network(format!("Request failed: {}", err))
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Malformed(format!("Failed to parse response: {}", e)));
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(body);

        Err(classify_status(status, retry_after, message))
    }
}

/// Parse a `Retry-After` header given in seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a non-success HTTP status to an error of the right class.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => Error::Timeout(Duration::ZERO),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::UNAUTHORIZED => Error::Authentication(message),
        StatusCode::FORBIDDEN => Error::PermissionDenied(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::InvalidInput(message),
        s if s.is_server_error() => Error::Server {
            status: s.as_u16(),
            message,
        },
        s => Error::Remote {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_page(
        &self,
        collection: &CollectionId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page> {
        let url = self.endpoint(&format!("collections/{}/items", collection))?;
        let page_size = clamp_page_size(page_size).to_string();
        debug!("Fetching page of {} (cursor {:?})", collection, cursor);

        let mut request = self
            .http
            .get(url)
            .query(&[("page_size", page_size.as_str())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }

        self.send(request).await
    }

    async fn fetch_item(&self, item: &ItemId) -> Result<RemoteItem> {
        let url = self.endpoint(&format!("items/{}", item))?;
        self.send(self.http.get(url)).await
    }

    async fn write_item(&self, item: &ItemId, patch: &ItemPatch) -> Result<RemoteItem> {
        let url = self.endpoint(&format!("items/{}", item))?;
        self.send(self.http.patch(url).json(patch)).await
    }

    async fn fetch_schema(&self, collection: &CollectionId) -> Result<CollectionSchema> {
        let url = self.endpoint(&format!("collections/{}/schema", collection))?;
        self.send(self.http.get(url)).await
    }
}
