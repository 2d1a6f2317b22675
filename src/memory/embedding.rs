//! Embedding backend (`SPEC_FULL.md` §4.3 added): `fastembed::TextEmbedding`
//! wrapped with a sync `embed`/`embed_one` core and an async `embed_text`
//! that offloads to `spawn_blocking` since fastembed is CPU-bound.

use crate::error::Result;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// One cached `TextEmbedding` instance per configured embedding model id,
/// since construction loads model weights from disk/cache.
pub struct EmbeddingCache {
    models: RwLock<HashMap<String, Arc<Mutex<TextEmbedding>>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_init(&self, model_id: &str) -> Result<Arc<Mutex<TextEmbedding>>> {
        if let Some(m) = self.models.read().await.get(model_id) {
            return Ok(m.clone());
        }

        let mut guard = self.models.write().await;
        if let Some(m) = guard.get(model_id) {
            return Ok(m.clone());
        }

        let fastembed_model = resolve_model(model_id)?;
        let model_id_owned = model_id.to_string();
        let instance = tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new(InitOptions::new(fastembed_model))
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .map_err(|e| anyhow::anyhow!("failed to init embedding model {model_id_owned}: {e}"))?;

        let arc = Arc::new(Mutex::new(instance));
        guard.insert(model_id.to_string(), arc.clone());
        Ok(arc)
    }

    /// Embed a batch of texts with the given model, offloaded to a blocking
    /// thread pool since `fastembed` inference is CPU-bound.
    pub async fn embed_text(&self, model_id: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = self.get_or_init(model_id).await?;
        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|p| p.into_inner());
            model.embed(texts, None)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .map_err(|e| anyhow::anyhow!("embedding failed: {e}"))?;
        Ok(embeddings)
    }

    pub async fn embed_one(&self, model_id: &str, text: &str) -> Result<Vec<f32>> {
        let mut v = self.embed_text(model_id, vec![text.to_string()]).await?;
        Ok(v.pop().unwrap_or_default())
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a model-ref suffix (after the `fastembed/` provider prefix) onto a
/// `fastembed::EmbeddingModel` variant. Defaults to BGE-small for unknown
/// ids rather than failing the whole `Add`/`Search` call.
fn resolve_model(model_id: &str) -> Result<EmbeddingModel> {
    let suffix = model_id.split_once('/').map(|(_, s)| s).unwrap_or(model_id);
    Ok(match suffix {
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        _ => EmbeddingModel::BGESmallENV15,
    })
}
