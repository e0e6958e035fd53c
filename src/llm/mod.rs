//! Model provider helpers
//!
//! Token counting, per-provider token rate limiting and the synthesized model
//! listing.

mod models;
mod rate_limit;
mod tokenizer;

pub use models::*;
pub use rate_limit::*;
pub use tokenizer::*;
