//! Request dispatch pipeline
//!
//! route -> transform -> rate limit -> authorize -> forward, with one forced token
//! refresh and retry when the provider answers 401 or 403.

use crate::auth::TokenService;
use crate::config::{GatewayConfig, SnapshotReader};
use crate::error::{GatewayError, Result};
use crate::llm::{is_models_path, model_list, RateLimiter, TiktokenCounter, Tokenizer, UsageSnapshot};
use crate::observability::{DebugRecord, DebugSink};
use crate::router;
use crate::transform;
use crate::upstream::{build_upstream_url, forward_headers, outbound_body, response_headers};
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Tokens consumed in the trailing minute
pub const TOKEN_USED_HEADER: &str = "x-token-limit-per-minute-used";

/// Headroom left under the per-minute limit
pub const TOKEN_AVAILABLE_HEADER: &str = "x-token-limit-per-minute-available";

/// Body type of every gateway response
pub type ResponseBody = UnsyncBoxBody<Bytes, GatewayError>;

/// Build the shared outbound client
///
/// Redirects are returned to the caller instead of followed.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| GatewayError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Per-request orchestration over the long-lived gateway services
pub struct Dispatcher {
    config: SnapshotReader,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    tokens: Arc<TokenService>,
    tokenizer: Arc<dyn Tokenizer>,
    debug_sink: Option<Arc<dyn DebugSink>>,
}

impl Dispatcher {
    /// Create a dispatcher with a fresh rate limiter, token service and tiktoken counter
    pub fn new(config: SnapshotReader, client: reqwest::Client) -> Self {
        let tokens = Arc::new(TokenService::new(client.clone(), config.clone()));
        Self {
            config,
            client,
            limiter: Arc::new(RateLimiter::new()),
            tokens,
            tokenizer: Arc::new(TiktokenCounter::new()),
            debug_sink: None,
        }
    }

    /// Replace the tokenizer used for rate limit estimates
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Bound the token exchange; a timed out exchange forwards the original credential
    pub fn with_token_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.tokens = Arc::new(
            TokenService::new(self.client.clone(), self.config.clone()).with_timeout(timeout),
        );
        self
    }

    /// Capture forwarded requests and responses
    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn token_service(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Create or resize the bucket of every rate-limited provider
    pub fn register_limits(&self, config: &GatewayConfig) {
        register_limits(&self.limiter, config);
    }

    /// Handle one request with a fully read body
    pub async fn dispatch(
        &self,
        request: Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Response<ResponseBody>> {
        let config = self.config.load();
        let path = request.uri().path().to_string();

        let route = router::resolve(&config.providers, &path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.clone()))?;
        let remaining = route.remaining_path(&path);

        if request.method() == Method::GET && is_models_path(remaining) {
            debug!(provider = %route.name, "Serving model listing");
            return json_response(StatusCode::OK, &model_list(route.name, route.provider));
        }

        let (parts, body) = request.into_parts();
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let prepared = transform::prepare(&body, content_type, route.provider, &path);

        let limit = route.provider.token_limit_per_minute;
        let mut usage: Option<UsageSnapshot> = None;
        if limit > 0 {
            self.limiter.register_limit(route.name, limit);
            if let Some(payload) = &prepared.token_count_payload {
                let tokens = self
                    .tokenizer
                    .count_tokens(payload, prepared.resolved_model.as_deref()) as u64;
                self.limiter
                    .wait_for_tokens(route.name, limit, tokens, cancel)
                    .await?;
            }
            usage = self.limiter.usage_snapshot(route.name);
        }

        let url = build_upstream_url(
            &route.provider.upstream_template,
            prepared.resolved_model.as_deref(),
            remaining,
            parts.uri.query(),
        )?;
        let body = outbound_body(&parts.method, &prepared.forward_body);
        let headers = forward_headers(&parts.headers, body.as_ref(), prepared.mutated);

        let credential = if config.convert_token {
            parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        } else {
            None
        };

        let attempt = Attempt {
            method: &parts.method,
            url: &url,
            headers: &headers,
            body: body.as_ref(),
            credential: credential.as_deref(),
        };

        let mut upstream = self.forward(&attempt, false, cancel).await?;
        if credential.is_some()
            && matches!(upstream.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        {
            info!(
                provider = %route.name,
                status = upstream.status().as_u16(),
                "Upstream rejected token, refreshing and retrying"
            );
            drop(upstream);
            upstream = self.forward(&attempt, true, cancel).await?;
        }

        info!(
            provider = %route.name,
            model = prepared.resolved_model.as_deref().unwrap_or(""),
            status = upstream.status().as_u16(),
            "Forwarded {} {}",
            parts.method,
            path
        );

        self.into_response(upstream, usage, &url, cancel).await
    }

    /// One forwarding attempt, authorizing first when a credential is present
    async fn forward(
        &self,
        attempt: &Attempt<'_>,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut headers = attempt.headers.clone();

        if let Some(credential) = attempt.credential {
            match self.tokens.get_token(credential, force_refresh, cancel).await? {
                Some(token) => match HeaderValue::from_str(&format!("Bearer {}", token)) {
                    Ok(value) => {
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(_) => warn!("Upstream token is not a valid header value, keeping original"),
                },
                None => debug!("No upstream token available, forwarding original authorization"),
            }
        }

        if let Some(sink) = self.active_debug_sink() {
            sink.record(DebugRecord::request(
                attempt.method,
                attempt.url.as_str(),
                &headers,
                attempt.body.map(|b| &b[..]).unwrap_or_default(),
            ));
        }

        let mut request = self
            .client
            .request(attempt.method.clone(), attempt.url.clone())
            .headers(headers);
        if let Some(body) = attempt.body {
            request = request.body(body.clone());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = request.send() => result.map_err(|e| {
                warn!("Upstream request to {} failed: {}", attempt.url, e);
                GatewayError::Upstream(format!("Request to {} failed: {}", attempt.url, e))
            }),
        }
    }

    /// Relay the provider response, adding usage headers
    async fn into_response(
        &self,
        upstream: reqwest::Response,
        usage: Option<UsageSnapshot>,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Response<ResponseBody>> {
        let status = upstream.status();
        let mut headers = response_headers(upstream.headers());
        if let Some(usage) = usage {
            headers.insert(TOKEN_USED_HEADER, HeaderValue::from(usage.used));
            headers.insert(TOKEN_AVAILABLE_HEADER, HeaderValue::from(usage.available));
        }

        let body = match self.active_debug_sink() {
            Some(sink) => {
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    result = upstream.bytes() => result.map_err(|e| {
                        GatewayError::Upstream(format!("Failed to read response from {}: {}", url, e))
                    })?,
                };
                sink.record(DebugRecord::response(status, url.as_str(), &headers, &bytes));
                full_body(bytes)
            }
            None => {
                let stream = upstream
                    .bytes_stream()
                    .map_ok(Frame::data)
                    .map_err(|e| GatewayError::Upstream(format!("Response stream failed: {}", e)));
                StreamBody::new(stream).boxed_unsync()
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn active_debug_sink(&self) -> Option<&Arc<dyn DebugSink>> {
        self.debug_sink.as_ref().filter(|sink| sink.is_enabled())
    }
}

/// Everything needed to (re)send a request upstream
struct Attempt<'a> {
    method: &'a Method,
    url: &'a Url,
    headers: &'a HeaderMap,
    body: Option<&'a Bytes>,
    credential: Option<&'a str>,
}

/// Create or resize the bucket of every rate-limited provider
pub fn register_limits(limiter: &RateLimiter, config: &GatewayConfig) {
    for (name, provider) in &config.providers {
        limiter.register_limit(name, provider.token_limit_per_minute);
    }
}

/// Wrap a complete body
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text response
pub fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<ResponseBody>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize response: {}", e)))?;
    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::llm::CharEstimateCounter;
    use std::collections::BTreeMap;

    fn dispatcher() -> Dispatcher {
        let provider = ProviderConfig {
            route_prefix: "/openai".to_string(),
            upstream_template: "http://127.0.0.1:9/{model}".to_string(),
            model_ids: vec!["gpt-4".to_string(), "fast".to_string()],
            token_limit_per_minute: 100,
            ..Default::default()
        };
        let config = GatewayConfig {
            providers: BTreeMap::from([("openai".to_string(), provider)]),
            ..Default::default()
        };
        Dispatcher::new(SnapshotReader::fixed(config), reqwest::Client::new())
            .with_tokenizer(Arc::new(CharEstimateCounter))
    }

    async fn body_text(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let request = Request::get("/anthropic/v1/messages").body(Bytes::new()).unwrap();
        let result = dispatcher().dispatch(request, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::RouteNotFound(_))));
    }

    #[tokio::test]
    async fn test_models_listing_bypasses_forwarding() {
        let request = Request::get("/OpenAI/v1/models").body(Bytes::new()).unwrap();
        let response = dispatcher()
            .dispatch(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(TOKEN_USED_HEADER).is_none());
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["object"], "list");
        assert_eq!(value["data"][1]["id"], "fast");
        assert_eq!(value["data"][1]["owned_by"], "openai");
    }

    #[tokio::test]
    async fn test_cancelled_during_rate_limit_wait() {
        let dispatcher = dispatcher();
        assert_eq!(
            dispatcher.rate_limiter().try_acquire("openai", 100, 100),
            crate::llm::Admission::Granted
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = Request::post("/openai/v1/chat/completions")
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"{\"model\":\"gpt-4\",\"messages\":[]}"))
            .unwrap();

        let result = dispatcher.dispatch(request, &cancel).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
