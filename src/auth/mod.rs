//! Upstream credential exchange
//!
//! Inbound `authorization` header values are exchanged at the configured token
//! endpoint for a bearer token, which is cached per distinct header value for the
//! life of the process. Refreshes are serialized per header value so concurrent
//! requests carrying the same credential trigger at most one exchange.

use crate::config::SnapshotReader;
use crate::error::{GatewayError, Result};
use crate::transform::is_json_content_type;
use dashmap::DashMap;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fields checked, in order, in a JSON token response
const TOKEN_FIELDS: [&str; 3] = ["token", "access_token", "accessToken"];

/// Upper bound on one exchange, connect through body
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A cached upstream token
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub last_updated: Instant,
}

/// Token exchange service with a per-credential cache
pub struct TokenService {
    client: reqwest::Client,
    config: SnapshotReader,
    cache: DashMap<String, CachedToken>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl TokenService {
    pub fn new(client: reqwest::Client, config: SnapshotReader) -> Self {
        Self {
            client,
            config,
            cache: DashMap::new(),
            locks: DashMap::new(),
            timeout: TOKEN_EXCHANGE_TIMEOUT,
        }
    }

    /// Limit how long one exchange may take before it counts as failed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cached token for a credential, if any
    pub fn cached_token(&self, credential: &str) -> Option<String> {
        self.cache.get(credential).map(|entry| entry.token.clone())
    }

    /// Get an upstream token for an inbound credential
    ///
    /// Returns `Ok(None)` when no token could be obtained; exchange failures are
    /// logged, never returned. The only error is [`GatewayError::Cancelled`].
    pub async fn get_token(
        &self,
        credential: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let requested_at = Instant::now();

        if !force_refresh {
            if let Some(token) = self.cached_token(credential) {
                return Ok(Some(token));
            }
        }

        let lock = self.lock_for(credential);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            guard = lock.lock() => guard,
        };

        // Another holder of the lock may have refreshed while we waited
        if let Some(entry) = self.cache.get(credential) {
            if !force_refresh || entry.last_updated > requested_at {
                debug!("Using token refreshed by a concurrent request");
                return Ok(Some(entry.token.clone()));
            }
        }

        let exchanged = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = self.exchange(credential) => result,
        };

        match exchanged {
            Ok(Some(token)) => {
                self.cache.insert(
                    credential.to_string(),
                    CachedToken {
                        token: token.clone(),
                        last_updated: Instant::now(),
                    },
                );
                info!(forced = force_refresh, "Upstream token refreshed");
                Ok(Some(token))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Token exchange failed: {}", e);
                Ok(None)
            }
        }
    }

    fn lock_for(&self, credential: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(credential) {
            return lock.clone();
        }
        self.locks
            .entry(credential.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// POST to the token endpoint carrying the inbound credential
    async fn exchange(&self, credential: &str) -> Result<Option<String>> {
        let endpoint = self.config.load().token_endpoint.clone();
        if endpoint.is_empty() {
            debug!("No token endpoint configured");
            return Ok(None);
        }

        debug!("Exchanging credential at {}", endpoint);
        let response = self
            .client
            .post(&endpoint)
            .header(AUTHORIZATION, credential)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::TokenExchange(format!("Request to {} failed: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Token endpoint rejected credential");
            return Ok(None);
        }

        let is_json = is_json_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::TokenExchange(format!("Failed to read token response: {}", e)))?;

        Ok(parse_token_body(&body, is_json))
    }
}

/// Extract a token from an exchange response body
///
/// JSON bodies yield the first of [`TOKEN_FIELDS`] that is present (an empty
/// string there means no token); anything else, or JSON without those fields,
/// yields the trimmed body.
pub fn parse_token_body(body: &str, is_json: bool) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if is_json {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
            if let Some(value) = TOKEN_FIELDS.iter().find_map(|name| object.get(*name)) {
                let token = match value {
                    Value::String(token) => token.trim().to_string(),
                    other => other.to_string(),
                };
                return Some(token).filter(|t| !t.is_empty());
            }
        }
    }

    Some(trimmed.to_string())
}
