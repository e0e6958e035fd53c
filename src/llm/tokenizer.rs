//! Token counting for rate limit estimates
//!
//! The rate limiter only needs an estimate of request cost. [`TiktokenCounter`]
//! uses the BPE vocabulary of the requested model when tiktoken knows it and falls
//! back to `cl100k_base`, then to a character estimate.

use dashmap::DashMap;
use std::sync::Arc;
use tiktoken_rs::get_bpe_from_tokenizer;
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer as Vocabulary};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Vocabulary used for models tiktoken does not recognize
const FALLBACK_VOCABULARY: Vocabulary = Vocabulary::Cl100kBase;

/// Token counter trait
pub trait Tokenizer: Send + Sync {
    /// Count tokens in `text` using the vocabulary of `model`
    fn count_tokens(&self, text: &str, model: Option<&str>) -> usize;
}

/// Character-based estimate, approximately 4 characters per token
#[derive(Debug, Default, Clone, Copy)]
pub struct CharEstimateCounter;

impl Tokenizer for CharEstimateCounter {
    fn count_tokens(&self, text: &str, _model: Option<&str>) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// BPE token counter backed by tiktoken
///
/// Models are mapped to their vocabulary first; one encoder is built per
/// vocabulary, so the cache is bounded no matter which model names clients send.
#[derive(Default)]
pub struct TiktokenCounter {
    encoders: DashMap<Vocabulary, Option<Arc<CoreBPE>>>,
    fallback: CharEstimateCounter,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&self, model: Option<&str>) -> Option<Arc<CoreBPE>> {
        let vocabulary = vocabulary_for(model);
        if let Some(cached) = self.encoders.get(&vocabulary) {
            return cached.clone();
        }

        self.encoders
            .entry(vocabulary)
            .or_insert_with(|| load_encoder(vocabulary).map(Arc::new))
            .clone()
    }
}

/// Vocabulary for a model name, `cl100k_base` when tiktoken does not know it
fn vocabulary_for(model: Option<&str>) -> Vocabulary {
    let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) else {
        return FALLBACK_VOCABULARY;
    };

    get_tokenizer(&model.to_ascii_lowercase()).unwrap_or_else(|| {
        debug!("No tiktoken vocabulary for model {}, using {:?}", model, FALLBACK_VOCABULARY);
        FALLBACK_VOCABULARY
    })
}

fn load_encoder(vocabulary: Vocabulary) -> Option<CoreBPE> {
    match get_bpe_from_tokenizer(vocabulary) {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!("Failed to load {:?} vocabulary: {}", vocabulary, e);
            None
        }
    }
}

impl Tokenizer for TiktokenCounter {
    fn count_tokens(&self, text: &str, model: Option<&str>) -> usize {
        match self.encoder(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => self.fallback.count_tokens(text, model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_estimate() {
        let counter = CharEstimateCounter;
        assert_eq!(counter.count_tokens("", None), 0);
        assert_eq!(counter.count_tokens("abcd", None), 1);
        assert_eq!(counter.count_tokens("abcde", None), 2);
        assert_eq!(counter.count_tokens("ééééé", None), 2);
    }

    #[test]
    fn test_tiktoken_known_model() {
        let counter = TiktokenCounter::new();
        let count = counter.count_tokens("Hello, world!", Some("gpt-4"));
        assert!(count > 0 && count < 10, "count was {}", count);
    }

    #[test]
    fn test_tiktoken_unknown_model_falls_back() {
        let counter = TiktokenCounter::new();
        let known = counter.count_tokens("The quick brown fox", Some("gpt-4"));
        let unknown = counter.count_tokens("The quick brown fox", Some("my-private-model"));
        assert_eq!(known, unknown);
        assert!(counter.encoders.contains_key(&Vocabulary::Cl100kBase));
    }

    #[test]
    fn test_unknown_model_names_share_one_encoder() {
        let counter = TiktokenCounter::new();
        for i in 0..20 {
            let model = format!("private-model-{}", i);
            assert!(counter.count_tokens("hello there", Some(&model)) > 0);
        }
        counter.count_tokens("hello there", None);
        counter.count_tokens("hello there", Some("gpt-4"));

        assert_eq!(counter.encoders.len(), 1);
    }

    #[test]
    fn test_models_map_to_their_vocabulary() {
        assert_eq!(vocabulary_for(Some("GPT-4")), Vocabulary::Cl100kBase);
        assert_eq!(vocabulary_for(Some("text-davinci-003")), Vocabulary::P50kBase);
        assert_eq!(vocabulary_for(Some("  ")), FALLBACK_VOCABULARY);
        assert_eq!(vocabulary_for(Some("my-private-model")), FALLBACK_VOCABULARY);
    }

    #[test]
    fn test_tiktoken_without_model() {
        let counter = TiktokenCounter::new();
        assert!(counter.count_tokens("some request text", None) > 0);
    }
}
