use std::time::Duration;

use futures_util::StreamExt;

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::RelayError;
use crate::protocol::NormalizedChat;
use crate::stream::sse::{sse_event_stream, SseEventStream};

const ERROR_BODY_SNIPPET_CHARS: usize = 512;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    // No overall request timeout: streams are long-lived, idle reads are bounded
    // per chunk instead.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Client for the upstream streaming chat endpoint.
///
/// Each [`UpstreamClient::open_stream`] call opens exactly one upstream
/// request; the returned event stream owns the response, so dropping it
/// releases the connection.
pub struct UpstreamClient {
    client: reqwest::Client,
    url: reqwest::Url,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    read_timeout: Duration,
}

impl UpstreamClient {
    /// Build the client from config.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for an unparseable URL or proxy.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, RelayError> {
        let url = reqwest::Url::parse(&upstream.url)
            .map_err(|err| RelayError::Config(format!("Invalid upstream URL: {err}")))?;
        let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
        };
        let client = build_reqwest_client(
            server.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            Duration::from_secs(upstream.connect_timeout_secs),
            server.http_use_env_proxy,
            upstream.proxy.as_deref(),
        )?;

        Ok(Self {
            client,
            url,
            api_key: upstream.api_key.clone(),
            temperature: upstream.temperature,
            max_tokens: upstream.max_tokens,
            read_timeout: Duration::from_secs(upstream.read_timeout_secs),
        })
    }

    #[must_use]
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    /// Override the idle timeout applied between response chunks.
    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Open one streaming request for `chat`.
    ///
    /// The request is never retried.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamUnavailable`] when the connection cannot be
    /// established, the response headers do not arrive within the read timeout,
    /// or the upstream answers with a non-2xx status.
    pub async fn open_stream(&self, chat: &NormalizedChat) -> Result<SseEventStream, RelayError> {
        let body = serde_json::to_vec(&chat.upstream_body(self.temperature, self.max_tokens))
            .map_err(|err| RelayError::Internal(format!("failed to encode upstream body: {err}")))?;

        let mut request = self
            .client
            .post(self.url.clone())
            .header(http::header::ACCEPT, "text/event-stream")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = match tokio::time::timeout(self.read_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(RelayError::unavailable(describe_send_error(&err))),
            Err(_) => {
                return Err(RelayError::unavailable(format!(
                    "no response headers from upstream within {}ms",
                    self.read_timeout.as_millis()
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let snippet = read_error_snippet(response, self.read_timeout).await;
            return Err(RelayError::UpstreamUnavailable {
                status: Some(status.as_u16()),
                message: format!("upstream returned {status}: {snippet}"),
            });
        }

        tracing::debug!(upstream = %self.url, model = %chat.model, "upstream stream opened");
        Ok(sse_event_stream(
            response.bytes_stream(),
            Some(self.read_timeout),
        ))
    }
}

/// Read at most a snippet of an error body. Each chunk wait is bounded by
/// `read_timeout`; a stalled or broken body yields whatever arrived so far.
async fn read_error_snippet(response: reqwest::Response, read_timeout: Duration) -> String {
    let mut body = Vec::new();
    let mut chunks = Box::pin(response.bytes_stream());
    while body.len() < ERROR_BODY_SNIPPET_CHARS * 4 {
        match tokio::time::timeout(read_timeout, chunks.next()).await {
            Ok(Some(Ok(chunk))) => body.extend_from_slice(&chunk),
            Ok(Some(Err(_)) | None) => break,
            Err(_) => {
                tracing::debug!("upstream error body stalled; returning partial snippet");
                break;
            }
        }
    }
    String::from_utf8_lossy(&body)
        .chars()
        .take(ERROR_BODY_SNIPPET_CHARS)
        .collect()
}

fn describe_send_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        format!("failed to connect to upstream: {err}")
    } else if err.is_timeout() {
        format!("upstream connection timed out: {err}")
    } else {
        format!("upstream request failed: {err}")
    }
}
