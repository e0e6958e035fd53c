//! Request body transformation
//!
//! Rewrites JSON request bodies according to provider policy before they are
//! forwarded:
//! - resolves the model (request value or provider default, then alias lookup)
//! - forces `stream=false` and drops `stream_options` on chat completions when the
//!   provider disables streaming
//! - strips configured top-level properties
//!
//! Bodies that need no change are forwarded byte-for-byte; only mutated bodies are
//! re-serialized.

use crate::config::ProviderConfig;
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::debug;

/// Suffix of paths subject to streaming suppression
const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

/// Result of preparing a request body for forwarding
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Body to send upstream
    pub forward_body: Bytes,
    /// Text fed to the tokenizer, when the body is JSON text
    pub token_count_payload: Option<String>,
    /// Model used for the upstream URL template
    pub resolved_model: Option<String>,
    /// Whether `forward_body` differs from the inbound body
    pub mutated: bool,
}

/// Whether a content type declares JSON (`application/json`, `application/*+json`)
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
        })
        .unwrap_or(false)
}

/// Resolve the effective model for a request
///
/// The requested model (trimmed) wins over the provider default; the result is then
/// replaced by its canonical name if it is a declared alias.
pub fn resolve_model(requested: Option<&str>, provider: &ProviderConfig) -> Option<String> {
    let model = requested
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .or(provider.default_model.as_deref())?;

    Some(
        provider
            .canonical_model(model)
            .unwrap_or(model)
            .to_string(),
    )
}

/// Prepare an inbound body for forwarding to `provider`
pub fn prepare(
    body: &Bytes,
    content_type: Option<&str>,
    provider: &ProviderConfig,
    path: &str,
) -> PreparedRequest {
    let passthrough = |payload: Option<String>| PreparedRequest {
        forward_body: body.clone(),
        token_count_payload: payload,
        resolved_model: resolve_model(None, provider),
        mutated: false,
    };

    if body.is_empty() || !is_json_content_type(content_type) {
        return passthrough(None);
    }

    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(_) => return passthrough(None),
    };

    let mut object = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => object,
        Ok(_) => return passthrough(Some(text.to_string())),
        Err(e) => {
            debug!("Forwarding malformed JSON body unchanged: {}", e);
            return passthrough(Some(text.to_string()));
        }
    };

    let current = object
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let resolved_model = resolve_model(current.as_deref(), provider);

    let mut mutated = false;
    if let Some(model) = &resolved_model {
        if current.as_deref() != Some(model.as_str()) {
            object.insert("model".to_string(), Value::String(model.clone()));
            mutated = true;
        }
    }

    if provider.disable_streaming && is_chat_completions(path) {
        mutated |= suppress_streaming(&mut object);
    }

    for property in &provider.strip_request_properties {
        if object.shift_remove(property).is_some() {
            mutated = true;
        }
    }

    if !mutated {
        return PreparedRequest {
            forward_body: body.clone(),
            token_count_payload: Some(text.to_string()),
            resolved_model,
            mutated: false,
        };
    }

    match serde_json::to_string(&Value::Object(object)) {
        Ok(serialized) => PreparedRequest {
            forward_body: Bytes::from(serialized.clone()),
            token_count_payload: Some(serialized),
            resolved_model,
            mutated: true,
        },
        Err(e) => {
            debug!("Failed to re-serialize request body, forwarding original: {}", e);
            passthrough(Some(text.to_string()))
        }
    }
}

fn is_chat_completions(path: &str) -> bool {
    path.len() >= CHAT_COMPLETIONS_SUFFIX.len()
        && path.as_bytes()[path.len() - CHAT_COMPLETIONS_SUFFIX.len()..]
            .eq_ignore_ascii_case(CHAT_COMPLETIONS_SUFFIX.as_bytes())
}

/// Force `stream=false` and drop `stream_options`; returns whether anything changed
fn suppress_streaming(object: &mut Map<String, Value>) -> bool {
    let mut changed = false;

    if object.get("stream") != Some(&Value::Bool(false)) {
        object.insert("stream".to_string(), Value::Bool(false));
        changed = true;
    }

    if object.shift_remove("stream_options").is_some() {
        changed = true;
    }

    changed
}
