//! Query embedding.
//!
//! The model is loaded once at startup and shared by every query. Inference
//! is serialized behind a mutex and runs on the blocking pool.

use std::sync::{Arc, Mutex};

use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};

use crate::config::ModelConfig;
use crate::error::{Result, ServiceError};

/// Dimension of all-MiniLM-L6-v2, the default model.
pub const EMB_DIM: usize = 384;

const PROBE_TEXT: &str = "dimension probe";

/// A sentence-embedding model. Output does not have to be normalized.
pub trait Embed: Send {
    fn embed(&mut self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub struct FastEmbedModel {
    model: TextEmbedding,
    model_code: String,
}

impl FastEmbedModel {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let (model, model_code) = resolve_model(&config.name, config.dimension)?;
        log::info!("Initializing embedding model: {}", model_code);

        let mut options =
            TextInitOptions::new(model).with_show_download_progress(config.show_download_progress);
        if let Some(cache_dir) = &config.cache_dir {
            options = options.with_cache_dir(cache_dir.clone());
        }

        let model = TextEmbedding::try_new(options)
            .map_err(|e| ServiceError::Model(format!("failed to load {}: {}", config.name, e)))?;
        log::info!("Embedding model initialized successfully");
        Ok(Self { model, model_code })
    }

    /// Fully qualified code of the resolved model, e.g. `Qdrant/all-MiniLM-L6-v2-onnx`.
    pub fn model_code(&self) -> &str {
        &self.model_code
    }
}

impl Embed for FastEmbedModel {
    fn embed(&mut self, text: &str) -> anyhow::Result<Vec<f32>> {
        let embeddings = self.model.embed(vec![text], None)?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("model returned no embedding"))
    }
}

fn short_model_name(name: &str) -> &str {
    let tail = name.rsplit('/').next().unwrap_or(name);
    tail.strip_suffix("-onnx").unwrap_or(tail)
}

/// Accepts a full model code (`Qdrant/all-MiniLM-L6-v2-onnx`) or its short
/// form (`all-MiniLM-L6-v2`).
fn model_name_matches(model_code: &str, name: &str) -> bool {
    model_code.eq_ignore_ascii_case(name)
        || short_model_name(model_code).eq_ignore_ascii_case(short_model_name(name))
}

fn resolve_model(name: &str, dimension: usize) -> Result<(EmbeddingModel, String)> {
    let supported = TextEmbedding::list_supported_models();
    let info = supported
        .iter()
        .find(|info| info.model_code.eq_ignore_ascii_case(name))
        .or_else(|| {
            supported
                .iter()
                .find(|info| model_name_matches(&info.model_code, name))
        })
        .ok_or_else(|| ServiceError::Model(format!("unknown embedding model: {}", name)))?;

    if info.dim != dimension {
        return Err(ServiceError::Model(format!(
            "model {} produces {}-dimensional vectors, configured dimension is {}",
            info.model_code, info.dim, dimension
        )));
    }
    Ok((info.model.clone(), info.model_code.clone()))
}

/// Scales `v` to unit length. Returns false for zero or non-finite vectors.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

#[derive(Clone)]
pub struct Encoder {
    model: Arc<Mutex<Box<dyn Embed>>>,
    model_name: String,
    dimension: usize,
}

impl Encoder {
    pub fn new(model: impl Embed + 'static, model_name: &str, dimension: usize) -> Self {
        Self {
            model: Arc::new(Mutex::new(Box::new(model))),
            model_name: model_name.to_string(),
            dimension,
        }
    }

    /// Loads the configured model and checks its output dimension. The
    /// encoder is named after the resolved model code, not the configured alias.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let model = FastEmbedModel::load(config)?;
        let model_code = model.model_code().to_string();
        let encoder = Self::new(model, &model_code, config.dimension);
        encoder.probe()?;
        Ok(encoder)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn probe(&self) -> Result<()> {
        let v = self.encode_blocking(PROBE_TEXT)?;
        log::info!(
            "Embedding model {} ready ({} dimensions)",
            self.model_name,
            v.len()
        );
        Ok(())
    }

    pub fn encode_blocking(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| ServiceError::Model("model lock poisoned".to_string()))?;
            model
                .embed(text)
                .map_err(|e| ServiceError::Model(format!("inference failed: {}", e)))?
        };

        if v.len() != self.dimension {
            return Err(ServiceError::Model(format!(
                "model returned {} dimensions, expected {}",
                v.len(),
                self.dimension
            )));
        }
        if !l2_normalize(&mut v) {
            return Err(ServiceError::Model(
                "model returned a zero or non-finite vector".to_string(),
            ));
        }
        Ok(v)
    }

    pub async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let encoder = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || encoder.encode_blocking(&text))
            .await
            .map_err(|e| ServiceError::Model(format!("embedding task join error: {}", e)))?
    }
}

#[cfg(test)]
pub mod testing {
    use super::Embed;

    /// Bag-of-words embedder: each lowercased token bumps one FNV-hashed
    /// bucket, so texts sharing words point in similar directions.
    pub struct HashingEmbedder {
        pub dimension: usize,
    }

    fn fnv1a(s: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in s.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    impl HashingEmbedder {
        pub fn vector(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            // constant component keeps the empty string embeddable
            v[0] = 0.01;
            for token in text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
            {
                let bucket = (fnv1a(&token.to_lowercase()) % self.dimension as u64) as usize;
                v[bucket] += 1.0;
            }
            v
        }
    }

    impl Embed for HashingEmbedder {
        fn embed(&mut self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.vector(text))
        }
    }

    pub fn hashing_encoder() -> super::Encoder {
        super::Encoder::new(
            HashingEmbedder {
                dimension: super::EMB_DIM,
            },
            "hashing-test",
            super::EMB_DIM,
        )
    }
}
