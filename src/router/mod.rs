//! Provider routing
//!
//! Maps an inbound path to the provider with the most specific matching
//! `routePrefix`. Matching is ASCII case-insensitive and segment-aware (see
//! [`PrefixMatcher`]). Among several matches the longest prefix wins; equal-length
//! prefixes are resolved by provider name in lexicographic order, which is the
//! iteration order of the snapshot's provider map.

mod matcher;

pub use matcher::*;

use crate::config::ProviderConfig;
use std::collections::BTreeMap;
use tracing::debug;

/// A provider selected for a request
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    /// Provider name (rate limiter key, model listing owner)
    pub name: &'a str,
    /// Provider configuration
    pub provider: &'a ProviderConfig,
}

impl<'a> RouteMatch<'a> {
    /// Path below the provider prefix
    pub fn remaining_path<'p>(&self, path: &'p str) -> &'p str {
        PrefixMatcher::new(&self.provider.route_prefix)
            .strip(path)
            .unwrap_or(path)
    }
}

/// Resolve a request path to the most specific provider
pub fn resolve<'a>(
    providers: &'a BTreeMap<String, ProviderConfig>,
    path: &str,
) -> Option<RouteMatch<'a>> {
    let mut best: Option<RouteMatch<'a>> = None;

    for (name, provider) in providers {
        if !PrefixMatcher::new(&provider.route_prefix).matches(path) {
            continue;
        }

        let longer = best
            .map(|b| provider.route_prefix.len() > b.provider.route_prefix.len())
            .unwrap_or(true);
        if longer {
            best = Some(RouteMatch {
                name: name.as_str(),
                provider,
            });
        }
    }

    match &best {
        Some(m) => debug!(provider = %m.name, prefix = %m.provider.route_prefix, "Route matched for path: {}", path),
        None => debug!("No provider matched path: {}", path),
    }

    best
}
