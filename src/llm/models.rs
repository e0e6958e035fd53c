//! Synthesized model listing for `GET .../v1/models`

use crate::config::ProviderConfig;
use serde::Serialize;

const MODELS_SUFFIX: &str = "/v1/models";

/// OpenAI-style list envelope
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// A single listed model
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: String,
}

/// Whether a path (below the provider prefix) is the model listing endpoint
pub fn is_models_path(remaining_path: &str) -> bool {
    let path = remaining_path.as_bytes();
    path.len() >= MODELS_SUFFIX.len()
        && path[path.len() - MODELS_SUFFIX.len()..].eq_ignore_ascii_case(MODELS_SUFFIX.as_bytes())
}

/// Build the listing for a provider from its declared models and aliases
pub fn model_list(provider_name: &str, provider: &ProviderConfig) -> ModelList {
    ModelList {
        object: "list",
        data: provider
            .model_ids
            .iter()
            .map(|id| ModelEntry {
                id: id.clone(),
                object: "model",
                created: 0,
                owned_by: provider_name.to_string(),
            })
            .collect(),
    }
}
