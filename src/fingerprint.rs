//! Deterministic canonicalization + content hash of an extraction request,
//! plus the embedding lookup used by C³'s approximate-match path
//! (spec.md §4.1).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::models::{ContentHash, ExtractionRequest, Fingerprint, PartialFingerprint};

pub const MAX_CANONICAL_TEXT_LEN: usize = 32 * 1024;
pub const PARTITION_KEY_SEPARATOR: char = '\u{1f}';

/// External embedding provider. Returns a vector of any dimension; the
/// fingerprinter normalizes it to unit norm before it leaves this module,
/// so every consumer downstream can assume cosine similarity == dot product.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
        }
    }
}

pub struct Fingerprinter {
    embedding_provider: Arc<dyn EmbeddingProvider>,
    retry: RetryConfig,
    max_text_len: usize,
}

impl Fingerprinter {
    pub fn new(embedding_provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedding_provider,
            retry: RetryConfig::default(),
            max_text_len: MAX_CANONICAL_TEXT_LEN,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Derive the partition key from `context_tags` via a fixed total order
    /// (lexicographic sort), so distinct tag sets never collide and the
    /// same tag set always yields the same partition.
    pub fn partition_key(context_tags: &HashSet<String>) -> String {
        let mut tags: Vec<&str> = context_tags.iter().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags.join(&PARTITION_KEY_SEPARATOR.to_string())
    }

    pub fn content_hash(partition_key: &str, canonical_text: &str) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(partition_key.as_bytes());
        hasher.update([0x00]);
        hasher.update(canonical_text.as_bytes());
        hasher.finalize().into()
    }

    fn validate(&self, request: &ExtractionRequest) -> Result<()> {
        if request.canonical_text.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "canonical_text must not be empty".into(),
            ));
        }
        if request.canonical_text.len() > self.max_text_len {
            return Err(CoreError::InvalidRequest(format!(
                "canonical_text exceeds maximum length of {} bytes",
                self.max_text_len
            )));
        }
        if !(0.0..=1.0).contains(&request.quality_target) {
            return Err(CoreError::InvalidRequest(
                "quality_target must be within [0, 1]".into(),
            ));
        }
        if request.budget < 0.0 {
            return Err(CoreError::InvalidRequest(
                "budget must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Hash/partition half of the fingerprint. Pure, synchronous, never
    /// touches the embedding provider — this is what lets C³ fall back to
    /// exact-match-only when the embedding provider is down.
    pub fn partial(&self, request: &ExtractionRequest) -> Result<PartialFingerprint> {
        self.validate(request)?;
        let partition_key = Self::partition_key(&request.context_tags);
        let content_hash = Self::content_hash(&partition_key, &request.canonical_text);
        Ok(PartialFingerprint {
            content_hash,
            partition_key,
        })
    }

    /// Full fingerprint including the embedding. May return
    /// `EmbeddingUnavailable` after exhausting retries; this error must be
    /// surfaced, never silently substituted.
    pub async fn compute(&self, request: &ExtractionRequest) -> Result<Fingerprint> {
        let partial = self.partial(request)?;
        let embedding = self.embed_with_retry(&request.canonical_text).await?;
        Ok(Fingerprint {
            content_hash: partial.content_hash,
            embedding,
            partition_key: partial.partition_key,
        })
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        let mut delay = self.retry.base_delay;
        loop {
            match self.embedding_provider.embed(text).await {
                Ok(vector) => return Ok(normalize(vector)),
                Err(_) if attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                }
                Err(_) => return Err(CoreError::EmbeddingUnavailable),
            }
        }
    }
}

fn normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vector
    } else {
        vector.into_iter().map(|x| x / norm).collect()
    }
}
