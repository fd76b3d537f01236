//! Embedding Providers
//!
//! Vector representations for semantic memory retrieval.
//!
//! # Providers
//!
//! - [`KeywordEmbedding`]: deterministic feature hashing, works offline
//! - [`LocalEmbedding`]: all-MiniLM-L6-v2 via `fastembed` (feature `local-embeddings`)
//! - `OpenAiCompatible` in [`crate::capability`]: remote `/embeddings` endpoint
//!
//! Any provider may fail transiently; callers queue the work for retry.

use async_trait::async_trait;

use crate::utils::is_cjk;
use crate::Result;

/// Text-in, vector-out embedding capability
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = self.normalize_text(text);
        self.embed_batch(&[normalized])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| crate::MemoryError::transient("embedding", "no embedding returned"))
    }

    /// Generate embeddings for a batch of texts, one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get embedding dimension.
    fn dimension(&self) -> usize;

    /// Get model name.
    fn model_name(&self) -> &str;

    /// Normalize text before embedding.
    fn normalize_text(&self, text: &str) -> String {
        text.trim()
            .chars()
            .filter(|c| !c.is_control())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Compute cosine similarity between two vectors
///
/// Returns a value between -1.0 and 1.0; mismatched or zero vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = vector_norm(a);
    let norm_b = vector_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Cosine similarity with a precomputed norm for `b`
pub fn cosine_with_norm(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if a.len() != b.len() || norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot_product / (norm_a * norm_b)
}

/// L2 norm
pub fn vector_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyword (feature hashing) embedding
// ─────────────────────────────────────────────────────────────────────────────

/// Default dimension of the keyword embedder
pub const KEYWORD_DIMENSIONS: usize = 256;

/// Offline embedder hashing words and CJK characters into a fixed vector
///
/// Latin text contributes lowercased alphanumeric words; CJK text contributes
/// single characters plus adjacent-character bigrams, so "天气" matches both
/// "今天天气" and "天气预报".
pub struct KeywordEmbedding {
    dimensions: usize,
    model: String,
}

impl Default for KeywordEmbedding {
    fn default() -> Self {
        Self::new(KEYWORD_DIMENSIONS)
    }
}

impl KeywordEmbedding {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(8);
        Self {
            dimensions,
            model: format!("keyword-hash-{dimensions}"),
        }
    }

    /// Embed synchronously
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (feature, weight) in features(text) {
            let hash = fnv1a(feature.as_bytes());
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign * weight;
        }

        let norm = vector_norm(&vector);
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn features(text: &str) -> Vec<(String, f32)> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut prev_cjk: Option<char> = None;

    for c in text.chars().flat_map(char::to_lowercase) {
        if is_cjk(c) && c.is_alphanumeric() {
            flush_word(&mut word, &mut out);
            out.push((c.to_string(), 1.0));
            if let Some(prev) = prev_cjk {
                out.push((format!("{prev}{c}"), 1.5));
            }
            prev_cjk = Some(c);
        } else if c.is_alphanumeric() {
            word.push(c);
            prev_cjk = None;
        } else {
            flush_word(&mut word, &mut out);
            prev_cjk = None;
        }
    }
    flush_word(&mut word, &mut out);
    out
}

fn flush_word(word: &mut String, out: &mut Vec<(String, f32)>) {
    if !word.is_empty() {
        out.push((std::mem::take(word), 1.0));
    }
}

/// 64-bit FNV-1a
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ─────────────────────────────────────────────────────────────────────────────
// Local model embedding
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding dimensions for all-MiniLM-L6-v2
pub const LOCAL_EMBEDDING_DIMENSIONS: usize = 384;

/// Local inference with a lazily loaded all-MiniLM-L6-v2 model
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedding {
    model: std::sync::Arc<tokio::sync::RwLock<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedding {
    pub fn new() -> Self {
        Self {
            model: std::sync::Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    async fn ensure_model(&self) -> Result<()> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        if self.model.read().await.is_some() {
            return Ok(());
        }

        let mut model_guard = self.model.write().await;
        if model_guard.is_some() {
            return Ok(());
        }

        tracing::info!(model = "all-MiniLM-L6-v2", "Loading embedding model");
        let start = std::time::Instant::now();

        let mut init_options = InitOptions::default();
        init_options.model_name = EmbeddingModel::AllMiniLML6V2;
        init_options.show_download_progress = false;

        let model = TextEmbedding::try_new(init_options).map_err(|e| {
            crate::MemoryError::transient("embedding", format!("failed to load model: {e}"))
        })?;

        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "Embedding model loaded");
        *model_guard = Some(model);
        Ok(())
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_model().await?;

        let model_guard = self.model.read().await;
        let model = model_guard
            .as_ref()
            .ok_or_else(|| crate::MemoryError::transient("embedding", "model not initialized"))?;

        model.embed(texts.to_vec(), None).map_err(|e| {
            crate::MemoryError::transient("embedding", format!("failed to generate embeddings: {e}"))
        })
    }

    fn dimension(&self) -> usize {
        LOCAL_EMBEDDING_DIMENSIONS
    }

    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }
}
