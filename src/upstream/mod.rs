//! Upstream request construction
//!
//! Builds the provider URL from its template and the inbound request, and prepares
//! the header sets exchanged with the provider.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::Method;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static MODEL_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{model\}").expect("valid placeholder pattern"));

static DUPLICATE_SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/{2,}").expect("valid slash pattern"));

/// Build the upstream URL for a request
///
/// `{model}` is substituted case-insensitively (an unresolved model becomes an
/// empty string). The path below the route prefix is appended to the template's
/// own path with duplicate slashes collapsed. A non-empty inbound query replaces
/// the template's query verbatim.
pub fn build_upstream_url(
    template: &str,
    model: Option<&str>,
    remaining_path: &str,
    query: Option<&str>,
) -> Result<Url> {
    let model = model.unwrap_or_default();
    let substituted = MODEL_PLACEHOLDER.replace_all(template, regex::NoExpand(model));

    let mut url = Url::parse(&substituted).map_err(|e| {
        GatewayError::Upstream(format!("Invalid upstream URL '{}': {}", substituted, e))
    })?;

    let remaining = remaining_path.trim_start_matches('/');
    let joined = if remaining.is_empty() {
        url.path().to_string()
    } else {
        format!("{}/{}", url.path().trim_end_matches('/'), remaining)
    };
    let collapsed = DUPLICATE_SLASHES.replace_all(&joined, "/").into_owned();
    url.set_path(&collapsed);

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.set_query(Some(query));
    }

    Ok(url)
}

/// Headers for the forwarded request
///
/// Drops `host`; when the body was rewritten (or omitted) the length headers are
/// replaced to describe the body actually sent.
pub fn forward_headers(inbound: &HeaderMap, body: Option<&Bytes>, mutated: bool) -> HeaderMap {
    let mut headers = inbound.clone();
    headers.remove(HOST);

    match body {
        Some(body) if mutated => {
            headers.remove(TRANSFER_ENCODING);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        Some(_) => {}
        None => {
            headers.remove(TRANSFER_ENCODING);
            headers.remove(CONTENT_LENGTH);
        }
    }

    headers
}

/// Body to send, `None` for bodiless methods and empty bodies
pub fn outbound_body(method: &Method, body: &Bytes) -> Option<Bytes> {
    if *method == Method::GET || *method == Method::HEAD || body.is_empty() {
        None
    } else {
        Some(body.clone())
    }
}

/// Copy provider response headers, minus connection-level ones
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    headers
}
