//! modelgate - request-forwarding gateway for model provider APIs
//!
//! Sits in front of one or more upstream provider HTTP APIs and, per request:
//!
//! - **Routes** by longest case-insensitive path prefix to a configured provider
//! - **Rewrites** JSON bodies (model aliasing, streaming suppression, property stripping)
//! - **Rate limits** with a per-provider token bucket fed by a tokenizer estimate
//! - **Exchanges credentials** for upstream bearer tokens, cached per inbound header,
//!   with one forced refresh and retry on 401/403
//!
//! Configuration is hot reloaded from `config.json` plus an environment overlay.
//!
//! # Quick Start
//!
//! ```no_run
//! use modelgate::{ConfigStore, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> modelgate::Result<()> {
//!     let store = Arc::new(ConfigStore::open("/etc/modelgate")?);
//!     Server::new(store)?.run().await
//! }
//! ```
//!
//! # Configuration
//!
//! ```json
//! {
//!   "port": 8080,
//!   "convertToken": true,
//!   "tokenEndpoint": "https://auth.internal/exchange",
//!   "providers": {
//!     "openai": {
//!       "routePrefix": "/openai",
//!       "upstreamTemplate": "https://api.openai.com",
//!       "defaultModel": "gpt-4o",
//!       "models": { "gpt-4o": { "modelAlias": ["fast", "default"] } },
//!       "disableStreaming": false,
//!       "stripRequestProperties": ["user"],
//!       "tokenLimitPerMinute": 90000
//!     }
//!   }
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod router;
pub mod server;
pub mod transform;
pub mod upstream;

pub use config::{ConfigStore, GatewayConfig, ProviderConfig, SnapshotReader};
pub use error::{GatewayError, Result};
pub use server::{Dispatcher, Server};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
