//! Token counting with a deterministic fallback.
//!
//! The primary encoder is a byte-pair encoder selected by name. When the
//! preferred encoder cannot be constructed the factory degrades to an
//! approximate character-ratio count and warns exactly once for its
//! lifetime. Encoder instances are cached per factory; there is no
//! process-wide singleton so workspaces stay isolated.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tiktoken_rs::CoreBPE;

use crate::core::error::RagmillError;

pub const DEFAULT_ENCODER: &str = "cl100k_base";
const FALLBACK_CHARS_PER_TOKEN: usize = 4;

enum Encoding {
    Bpe(CoreBPE),
    Approximate,
}

/// Token counter bound to a named encoding.
pub struct TokenEncoder {
    name: String,
    encoding: Encoding,
}

impl TokenEncoder {
    /// Number of tokens required to represent `text`. Always `0` for the
    /// empty string; at least `1` otherwise.
    pub fn count(&self, text: &str) -> usize {
        match &self.encoding {
            Encoding::Bpe(bpe) => bpe.encode_with_special_tokens(text).len(),
            Encoding::Approximate => {
                if text.is_empty() {
                    0
                } else {
                    let chars = text.chars().count();
                    std::cmp::max(1, chars.div_ceil(FALLBACK_CHARS_PER_TOKEN))
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.encoding, Encoding::Approximate)
    }
}

/// Per-service encoder cache.
pub struct TokenEncoderFactory {
    cache: Mutex<FxHashMap<String, Arc<TokenEncoder>>>,
    fallback_notice_emitted: Mutex<bool>,
}

impl Default for TokenEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEncoderFactory {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(FxHashMap::default()),
            fallback_notice_emitted: Mutex::new(false),
        }
    }

    /// Return a cached encoder for `name`, loading it on first use.
    ///
    /// An unknown encoder name is an error. A load failure for the default
    /// encoder degrades to the approximate fallback.
    pub fn get(&self, name: &str) -> Result<Arc<TokenEncoder>, RagmillError> {
        if let Some(found) = self.cache.lock().unwrap().get(name) {
            return Ok(found.clone());
        }

        let loaded = match load_bpe(name) {
            Some(Ok(bpe)) => TokenEncoder {
                name: name.to_string(),
                encoding: Encoding::Bpe(bpe),
            },
            Some(Err(reason)) => {
                if name != DEFAULT_ENCODER {
                    return Err(RagmillError::TokenEncoder(format!(
                        "Token encoder {name:?} unavailable: {reason}"
                    )));
                }
                self.emit_fallback_notice(name, &reason);
                TokenEncoder {
                    name: name.to_string(),
                    encoding: Encoding::Approximate,
                }
            }
            None => {
                return Err(RagmillError::TokenEncoder(format!(
                    "Unknown token encoder: {name}"
                )))
            }
        };

        let shared = Arc::new(loaded);
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), shared.clone());
        Ok(shared)
    }

    /// Build a fallback encoder directly (used by tests and degraded runs).
    pub fn fallback(&self, name: &str) -> Arc<TokenEncoder> {
        self.emit_fallback_notice(name, "encoder unavailable");
        Arc::new(TokenEncoder {
            name: name.to_string(),
            encoding: Encoding::Approximate,
        })
    }

    fn emit_fallback_notice(&self, name: &str, reason: &str) {
        let mut emitted = self.fallback_notice_emitted.lock().unwrap();
        if !*emitted {
            eprintln!("warning: token encoder fallback for {name:?} ({reason}); counts are approximate");
            *emitted = true;
        }
    }
}

fn load_bpe(name: &str) -> Option<Result<CoreBPE, String>> {
    let result = match name {
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "o200k_base" => tiktoken_rs::o200k_base(),
        "p50k_base" => tiktoken_rs::p50k_base(),
        "r50k_base" => tiktoken_rs::r50k_base(),
        _ => return None,
    };
    Some(result.map_err(|err| err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_bounds() {
        let factory = TokenEncoderFactory::new();
        let encoder = factory.fallback(DEFAULT_ENCODER);
        assert_eq!(encoder.count(""), 0);
        assert_eq!(encoder.count("a"), 1);
        assert_eq!(encoder.count("abcd"), 1);
        assert_eq!(encoder.count("abcde"), 2);
        assert_eq!(encoder.count(&"x".repeat(41)), 11);
    }

    #[test]
    fn test_unknown_encoder_is_error() {
        let factory = TokenEncoderFactory::new();
        assert!(factory.get("made_up_encoder").is_err());
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let factory = TokenEncoderFactory::new();
        let first = factory.get(DEFAULT_ENCODER).unwrap();
        let second = factory.get(DEFAULT_ENCODER).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
