//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: deterministic hashed bag-of-words vectors; no model, no network.
//! - **[`OpenAiEmbedder`]**: calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models locally via fastembed (feature `local-embeddings`).
//!
//! Embedders are synchronous and owned by exactly one worker or retriever;
//! callers on the async side move them onto the blocking pool.
//!
//! Also provides vector utilities:
//! - [`l2_norm`]: Euclidean norm, used to normalize cosine scores
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s (capped at 2^5)

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_HASH_DIMS: usize = 384;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

/// Turns text into a dense vector.
pub trait Embedder: Send {
    /// Returns the model identifier (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
    fn encode(&mut self, text: &str) -> Result<Vec<f32>>;
}

/// Everything needed to construct an [`Embedder`], in a form that can be
/// handed to a worker process on its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedderSettings {
    /// `local`, `ollama`, `openai` or `hash`.
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub dims: Option<usize>,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: DEFAULT_MODEL.to_string(),
            url: None,
            dims: None,
        }
    }
}

/// Create the [`Embedder`] selected by `settings.provider`.
///
/// | Provider | Embedder |
/// |----------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
///
/// Construction is cheap: model weights and HTTP clients are created on
/// the first [`Embedder::encode`] call.
pub fn create_embedder(settings: &EmbedderSettings) -> Result<Box<dyn Embedder>> {
    match settings.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(
            &settings.model,
            settings.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(
            &settings.model,
            settings.url.as_deref(),
        )?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(
            &settings.model,
            settings.url.as_deref(),
        ))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalEmbedder::new(&settings.model)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash Embedder ============

/// Feature-hashing embedder: every lowercase word token adds ±1 to a bucket
/// chosen by its SHA-256, and the result is L2-normalized.
///
/// Identical texts give identical vectors and texts sharing words score
/// higher than unrelated ones, which is enough for offline use and tests.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims: dims.max(1),
        }
    }
}

impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn encode(&mut self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0f32; self.dims];
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            let trimmed = lowered.trim();
            if trimmed.is_empty() {
                return Ok(vector);
            }
            tokens.push(trimmed);
        }

        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

// ============ OpenAI Embedder ============

/// Calls `POST {url}/embeddings` (default `https://api.openai.com/v1`).
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    url: String,
    api_key: String,
    client: Option<reqwest::blocking::Client>,
}

impl OpenAiEmbedder {
    pub fn new(model: &str, url: Option<&str>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: model.to_string(),
            url: url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: None,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn encode(&mut self, text: &str) -> Result<Vec<f32>> {
        let client = http_client(&mut self.client)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = || {
            client
                .post(format!("{}/embeddings", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        };
        let json = send_with_retry("OpenAI", request)?;
        first_vector(parse_openai_response(&json)?)
    }
}

/// Extract the `data[].embedding` arrays in order.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        embeddings.push(json_floats(embedding)?);
    }
    Ok(embeddings)
}

// ============ Ollama Embedder ============

/// Calls `POST {url}/api/embed` (default `http://localhost:11434`).
/// Requires Ollama to be running with the model pulled.
pub struct OllamaEmbedder {
    model: String,
    url: String,
    client: Option<reqwest::blocking::Client>,
}

impl OllamaEmbedder {
    pub fn new(model: &str, url: Option<&str>) -> Self {
        Self {
            model: model.to_string(),
            url: url
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            client: None,
        }
    }
}

impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn encode(&mut self, text: &str) -> Result<Vec<f32>> {
        let client = http_client(&mut self.client)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = || client.post(format!("{}/api/embed", self.url)).json(&body);
        let json = send_with_retry("Ollama", request).map_err(|e| {
            anyhow::anyhow!("{} (is Ollama running at {}?)", e, self.url)
        })?;
        first_vector(parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let values = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
        result.push(json_floats(values)?);
    }
    Ok(result)
}

// ============ HTTP helpers ============

fn http_client(slot: &mut Option<reqwest::blocking::Client>) -> Result<reqwest::blocking::Client> {
    if let Some(client) = slot {
        return Ok(client.clone());
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()?;
    *slot = Some(client.clone());
    Ok(client)
}

/// Send the request built by `request`, retrying rate limits, server
/// errors and network failures with exponential backoff.
fn send_with_retry<F>(service: &str, request: F) -> Result<serde_json::Value>
where
    F: Fn() -> reqwest::blocking::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            std::thread::sleep(delay);
        }

        match request().send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json()?);
                }

                let body_text = response.text().unwrap_or_default();
                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        service,
                        status,
                        body_text
                    ));
                    continue;
                }
                bail!("{} API error {}: {}", service, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", service, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", service)))
}

/// Every element must be a JSON number.
fn json_floats(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| match v.as_f64() {
            Some(x) => Ok(x as f32),
            None => bail!("Invalid embedding value at index {}: {}", i, v),
        })
        .collect()
}

fn first_vector(vectors: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Local Embedder (fastembed) ============

/// Local inference via fastembed. The model is downloaded from Hugging Face
/// on first use and cached; after that no network calls are made.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    model_kind: fastembed::EmbeddingModel,
    model: Option<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(model_name: &str) -> Result<Self> {
        Ok(Self {
            model_name: model_name.to_string(),
            model_kind: to_fastembed_model(model_name)?,
            model: None,
        })
    }
}

#[cfg(feature = "local-embeddings")]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn encode(&mut self, text: &str) -> Result<Vec<f32>> {
        if self.model.is_none() {
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(self.model_kind.clone())
                    .with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
            self.model = Some(model);
        }
        let Some(model) = self.model.as_mut() else {
            bail!("Local embedding model unavailable");
        };

        let embeddings = model
            .embed(vec![text.to_string()], Some(1))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
        first_vector(embeddings)
    }
}

/// Map a sentence-transformers style name (case-insensitive, optional
/// `sentence-transformers/` or `BAAI/` prefix) to a fastembed model.
#[cfg(feature = "local-embeddings")]
fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    let lowered = name.to_lowercase();
    let short = lowered
        .trim_start_matches("sentence-transformers/")
        .trim_start_matches("baai/");
    match short {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l12-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML12V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        _ => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-MiniLM-L6-v2, all-MiniLM-L12-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             bge-large-en-v1.5, nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            name
        ),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use help_chat::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing bytes that do not form
/// a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Euclidean norm.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let mut embedder = HashEmbedder::new("test-model", 64);
        let a = embedder.encode("Install the printer driver").unwrap();
        let b = embedder.encode("install THE printer driver").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_prefers_shared_words() {
        let mut embedder = HashEmbedder::new("test-model", DEFAULT_HASH_DIMS);
        let query = embedder.encode("printer driver setup").unwrap();
        let related = embedder.encode("how to set up the printer driver").unwrap();
        let unrelated = embedder.encode("quarterly revenue spreadsheet").unwrap();
        // Hash vectors are unit length, so the dot product is the cosine.
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[test]
    fn hash_embedder_handles_symbol_only_and_blank_text() {
        let mut embedder = HashEmbedder::new("test-model", 16);
        assert!(l2_norm(&embedder.encode("!!!").unwrap()) > 0.0);
        assert_eq!(l2_norm(&embedder.encode("   ").unwrap()), 0.0);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let settings = EmbedderSettings {
            provider: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        let err = create_embedder(&settings).err().unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn parses_provider_responses() {
        let openai = serde_json::json!({"data": [{"embedding": [0.5, -1.0]}]});
        assert_eq!(parse_openai_response(&openai).unwrap(), vec![vec![0.5, -1.0]]);

        let ollama = serde_json::json!({"embeddings": [[1.0, 2.0, 3.0]]});
        assert_eq!(parse_ollama_response(&ollama).unwrap(), vec![vec![1.0, 2.0, 3.0]]);

        assert!(parse_ollama_response(&serde_json::json!({"error": "no model"})).is_err());
    }

    #[test]
    fn non_numeric_embedding_values_are_rejected() {
        let openai = serde_json::json!({"data": [{"embedding": [0.5, "NaN", 1.0]}]});
        let err = parse_openai_response(&openai).unwrap_err();
        assert!(err.to_string().contains("index 1"));

        let ollama = serde_json::json!({"embeddings": [[1.0, null]]});
        assert!(parse_ollama_response(&ollama).is_err());
    }
}
