//! Text → vector providers.
//!
//! The engine only sees the [`Embedder`] trait. Calls are blocking; a host
//! running inside an async runtime moves them onto a blocking pool.

use std::time::Duration;

use seahash::hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EmbeddingError;

pub const DEFAULT_HASH_DIMENSION: usize = 384;
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}

/// Deterministic feature-hashing embedder.
///
/// Identifiers and words are lower-cased and hashed into signed buckets,
/// adjacent-token pairs at half weight, and the result is L2-normalised.
/// Texts sharing vocabulary land close together under cosine distance, which
/// is enough for local use and tests without a model.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMENSION)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn bump(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = hash(feature.as_bytes());
        let bucket = (h % self.dimension as u64) as usize;
        // Top bit picks the sign so collisions cancel instead of pile up.
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }

        let tokens: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut vector = vec![0.0f32; self.dimension];
        if tokens.is_empty() {
            // Pure punctuation still deserves a stable, non-zero vector.
            self.bump(&mut vector, text, 1.0);
        }
        for token in &tokens {
            self.bump(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.bump(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }

    fn name(&self) -> &str {
        "hash"
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::blocking::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>) -> Result<Self, EmbeddingError> {
        Self::with_options(api_key, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, Duration::from_secs(30))
    }

    pub fn with_options(
        api_key: impl Into<String>,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::Unavailable("no API key configured".into()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                EmbeddingError::InvalidInput(format!("{status}: {body}"))
            } else {
                EmbeddingError::Unavailable(format!("{status}: {body}"))
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EmbeddingError::BadResponse("no embedding in response".into()))?;

        debug!(model = %self.model, dimension = vector.len(), "embedded text");
        Ok(vector)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Metric;

    #[test]
    fn hash_embedding_is_deterministic_and_normalised() {
        let e = HashEmbedder::new(64);
        let a = e.embed("def add(a, b): return a + b").unwrap();
        let b = e.embed("def add(a, b): return a + b").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_is_closer() {
        let e = HashEmbedder::default();
        let q = e.embed("SELECT * FROM users WHERE id = user_input").unwrap();
        let near = e.embed("query = 'SELECT * FROM users WHERE id = ' + user_input").unwrap();
        let far = e.embed("fn fibonacci(n: u64) -> u64 { n }").unwrap();
        let m = Metric::Cosine;
        assert!(m.distance(&q, &near) < m.distance(&q, &far));
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            HashEmbedder::default().embed("   "),
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert!(HashEmbedder::default().embed("{};").is_ok());
    }

    #[test]
    fn openai_requires_a_key() {
        assert!(matches!(
            OpenAiEmbedder::new(""),
            Err(EmbeddingError::Unavailable(_))
        ));
    }
}
