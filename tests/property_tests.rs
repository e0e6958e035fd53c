//! Property-based tests for modelgate
//!
//! These tests use proptest to verify properties hold for arbitrary inputs.

use bytes::Bytes;
use modelgate::config::{deep_merge, normalize_route_prefix, ProviderConfig};
use modelgate::llm::{Admission, CharEstimateCounter, RateLimiter, Tokenizer};
use modelgate::router::{self, PrefixMatcher};
use modelgate::transform::prepare;
use modelgate::upstream::build_upstream_url;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn provider(prefix: &str) -> ProviderConfig {
    ProviderConfig {
        route_prefix: prefix.to_string(),
        upstream_template: "https://upstream.example/{model}".to_string(),
        ..Default::default()
    }
}

// ============================================================================
// Routing Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Normalizing a prefix twice changes nothing
    #[test]
    fn prop_normalize_prefix_idempotent(prefix in "[a-zA-Z/]{0,30}") {
        let once = normalize_route_prefix(&prefix);
        prop_assert_eq!(normalize_route_prefix(&once), once);
    }

    /// A normalized non-root prefix starts with `/` and never ends with one
    #[test]
    fn prop_normalized_prefix_shape(prefix in "/?[a-z]{1,10}(/[a-z]{1,10}){0,3}/?") {
        let normalized = normalize_route_prefix(&prefix);
        prop_assert!(normalized.starts_with('/'));
        prop_assert!(!normalized.ends_with('/'));
    }

    /// Any path below a prefix matches it regardless of case
    #[test]
    fn prop_prefix_matches_descendants(
        prefix in "/[a-z]{1,10}",
        rest in "(/[a-zA-Z0-9]{1,8}){0,4}"
    ) {
        let path = format!("{}{}", prefix.to_uppercase(), rest);
        let matcher = PrefixMatcher::new(&prefix);
        prop_assert!(matcher.matches(&path));
        prop_assert_eq!(matcher.strip(&path), Some(rest.as_str()));
    }

    /// A sibling that only shares characters never matches
    #[test]
    fn prop_prefix_respects_segment_boundary(
        prefix in "/[a-z]{1,10}",
        extra in "[a-z0-9-]{1,5}"
    ) {
        let path = format!("{}{}/v1", prefix, extra);
        prop_assert!(!PrefixMatcher::new(&prefix).matches(&path));
    }

    /// The longest matching prefix wins whatever the provider names are
    #[test]
    fn prop_longest_prefix_wins(
        outer in "[a-z]{1,8}",
        inner in "[a-z]{1,8}",
        outer_name in "[a-z]{1,6}",
        inner_name in "[A-Z]{1,6}",
        tail in "(/[a-z]{1,8}){0,3}"
    ) {
        let mut providers = BTreeMap::new();
        providers.insert(outer_name.clone(), provider(&format!("/{}", outer)));
        providers.insert(inner_name.clone(), provider(&format!("/{}/{}", outer, inner)));

        let path = format!("/{}/{}{}", outer, inner, tail);
        let route = router::resolve(&providers, &path).unwrap();
        prop_assert_eq!(route.name, inner_name.as_str());
        prop_assert_eq!(route.remaining_path(&path), tail.as_str());
    }
}

// ============================================================================
// Transform Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Preparing an already prepared body is a no-op
    #[test]
    fn prop_prepare_idempotent(
        model in proptest::option::of("[a-z0-9-]{1,12}"),
        stream in any::<bool>(),
        user in proptest::option::of("[a-z]{1,8}"),
        content in "[ -~]{0,40}"
    ) {
        let mut config = provider("/openai");
        config.default_model = Some("gpt-4o".to_string());
        config.disable_streaming = true;
        config.strip_request_properties = vec!["user".to_string()];
        config.model_alias_lookup.insert("fast".to_string(), "gpt-4".to_string());

        let mut object = Map::new();
        if let Some(model) = model {
            object.insert("model".to_string(), Value::String(model));
        }
        object.insert("stream".to_string(), Value::Bool(stream));
        if let Some(user) = user {
            object.insert("user".to_string(), Value::String(user));
        }
        object.insert("messages".to_string(), json!([{ "role": "user", "content": content }]));

        let path = "/openai/v1/chat/completions";
        let body = Bytes::from(Value::Object(object).to_string());
        let first = prepare(&body, Some("application/json"), &config, path);
        let second = prepare(&first.forward_body, Some("application/json"), &config, path);

        prop_assert!(!second.mutated);
        prop_assert_eq!(&second.forward_body, &first.forward_body);
        prop_assert_eq!(second.resolved_model, first.resolved_model);
    }

    /// Non-JSON bodies are forwarded byte-for-byte
    #[test]
    fn prop_non_json_passthrough(body in proptest::collection::vec(any::<u8>(), 0..200)) {
        let mut config = provider("/openai");
        config.strip_request_properties = vec!["user".to_string()];

        let bytes = Bytes::from(body);
        let prepared = prepare(&bytes, Some("text/plain"), &config, "/openai/v1/embeddings");
        prop_assert!(!prepared.mutated);
        prop_assert_eq!(prepared.forward_body, bytes);
        prop_assert!(prepared.token_count_payload.is_none());
    }
}

// ============================================================================
// Upstream URL Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Joined upstream paths never contain empty segments
    #[test]
    fn prop_upstream_path_has_no_double_slashes(
        base in "(/[a-z]{1,6}){0,3}/?",
        remaining in "(/{1,3}[a-z0-9]{1,6}){0,4}/?",
        model in "[a-z0-9.-]{0,10}"
    ) {
        let template = format!("https://upstream.example{}/{{model}}", base);
        let url = build_upstream_url(&template, Some(&model), &remaining, None).unwrap();
        prop_assert!(!url.path().contains("//"), "path was {}", url.path());
    }

    /// The inbound query replaces the template query verbatim
    #[test]
    fn prop_inbound_query_wins(query in "[a-z]{1,6}=[a-z0-9]{1,6}(&[a-z]{1,6}=[a-z0-9]{1,6}){0,3}") {
        let url = build_upstream_url(
            "https://upstream.example/{model}?api-version=1",
            Some("gpt-4o"),
            "/v1/chat",
            Some(&query),
        )
        .unwrap();
        prop_assert_eq!(url.query(), Some(query.as_str()));
    }
}

// ============================================================================
// Configuration Merge Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Overlay scalars always win, base-only keys always survive
    #[test]
    fn prop_deep_merge_overlay_wins(
        base_only in "[a-z]{1,8}",
        shared in "[A-Z]{1,8}",
        base_value in any::<i64>(),
        overlay_value in any::<i64>()
    ) {
        let mut base = Map::new();
        base.insert(base_only.clone(), json!(base_value));
        base.insert(shared.clone(), json!({ "nested": base_value, "keep": true }));

        let mut overlay = Map::new();
        overlay.insert(shared.clone(), json!({ "nested": overlay_value }));

        deep_merge(&mut base, overlay);
        prop_assert_eq!(&base[&base_only], &json!(base_value));
        prop_assert_eq!(&base[&shared]["nested"], &json!(overlay_value));
        prop_assert_eq!(&base[&shared]["keep"], &json!(true));
    }
}

// ============================================================================
// Rate Limiting Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Requests larger than the whole budget are admitted without waiting
    #[test]
    fn prop_oversized_requests_admitted(limit in 1u64..10_000, extra in 1u64..10_000) {
        let limiter = RateLimiter::new();
        prop_assert_eq!(limiter.try_acquire("p", limit, limit), Admission::Granted);
        prop_assert_eq!(limiter.try_acquire("p", limit, limit + extra), Admission::Granted);
    }

    /// A fresh bucket never admits more than its limit in one burst
    #[test]
    fn prop_burst_bounded_by_limit(limit in 50u64..500, cost in 1u64..50) {
        let limiter = RateLimiter::new();
        let mut granted = 0u64;
        for _ in 0..(limit / cost + 5) {
            if limiter.try_acquire("p", limit, cost) == Admission::Granted {
                granted += cost;
            }
        }
        prop_assert!(granted <= limit + cost);
        let usage = limiter.usage_snapshot("p").unwrap();
        prop_assert_eq!(usage.used + usage.available, limit);
    }

    /// The character estimate grows with the text
    #[test]
    fn prop_char_estimate_monotonic(a in ".{0,100}", b in ".{0,100}") {
        let counter = CharEstimateCounter;
        let joined = format!("{}{}", a, b);
        prop_assert!(counter.count_tokens(&joined, None) >= counter.count_tokens(&a, None));
    }
}
