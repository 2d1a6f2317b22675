//! File-backed memory store: LanceDB for vector search (dense per
//! embedding-model, one sparse BM25 column) plus the per-bot manifest
//! described in `spec.md` §4.3/§6. Completes the integration the teacher's
//! `memory/lance.rs` stub was scaffolded for but never finished.

use crate::error::{IntegrityError, Result};
use crate::memory::types::{MemoryItem, Modality, Scope};
use arrow_array::{Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const TABLE_NAME: &str = "memory_items";

fn schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("bot_id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("scope_user", DataType::Utf8, true),
        Field::new("scope_agent", DataType::Utf8, true),
        Field::new("scope_run", DataType::Utf8, true),
        Field::new("modality", DataType::Utf8, false),
        Field::new("embedding_model_id", DataType::Utf8, false),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("updated_at", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
            false,
        ),
        // BM25 sparse "vector" keyed `sparse_hash`: stored as the raw
        // tokenized text so LanceDB's full-text index can score it; the
        // `sparse_hash` column caches the content hash for dedup checks
        // without reconstructing tokens.
        Field::new("sparse_hash", DataType::Utf8, false),
    ]))
}

pub struct LanceMemoryStore {
    connection: lancedb::Connection,
    vector_dim: i32,
}

impl LanceMemoryStore {
    pub async fn open(path: &std::path::Path, vector_dim: i32) -> Result<Self> {
        let connection = lancedb::connect(&path.to_string_lossy())
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self { connection, vector_dim })
    }

    async fn table(&self) -> Result<lancedb::Table> {
        match self.connection.open_table(TABLE_NAME).execute().await {
            Ok(t) => Ok(t),
            Err(_) => {
                let empty = RecordBatchIterator::new(
                    std::iter::empty::<std::result::Result<RecordBatch, arrow_schema::ArrowError>>(),
                    schema(self.vector_dim),
                );
                self.connection
                    .create_table(TABLE_NAME, Box::new(empty))
                    .execute()
                    .await
                    .map_err(|e| anyhow::anyhow!(e).into())
            }
        }
    }

    /// Upsert (delete-then-insert, LanceDB has no native upsert) a memory
    /// point with its dense vector and sparse token text.
    pub async fn upsert(&self, bot_id: crate::BotId, item: &MemoryItem, vector: Vec<f32>, sparse_text: &str) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("id = '{}'", item.id))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let batch = self.to_batch(bot_id, item, vector, sparse_text)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema(self.vector_dim));
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("id = '{id}'"))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    pub async fn delete_scope(&self, bot_id: crate::BotId, scope: &Scope) -> Result<Vec<Uuid>> {
        let ids = self.list_ids(bot_id, scope).await?;
        let table = self.table().await?;
        table
            .delete(&scope_predicate(bot_id, scope))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(ids)
    }

    /// Dense ANN search, scoped by `(bot_id, scope)`. Returns `(id, rank,
    /// score)` ordered by similarity descending.
    pub async fn search_dense(
        &self,
        bot_id: crate::BotId,
        scope: &Scope,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<crate::memory::types::SourceHit>> {
        let table = self.table().await?;
        let mut query = table
            .query()
            .nearest_to(vector)
            .map_err(|e| anyhow::anyhow!(e))?
            .only_if(scope_predicate(bot_id, scope))
            .limit(limit);

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .try_collect()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(batches_to_hits(&batches))
    }

    /// BM25 sparse search over `sparse_hash`'s backing full-text index.
    /// LanceDB's inverted index query API is used when available; absent a
    /// populated index this degenerates to an empty result set rather than
    /// failing the whole fused search.
    pub async fn search_sparse(
        &self,
        bot_id: crate::BotId,
        scope: &Scope,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<crate::memory::types::SourceHit>> {
        let table = self.table().await?;
        let result = table
            .query()
            .only_if(scope_predicate(bot_id, scope))
            .full_text_search(lancedb::query::FullTextSearchQuery::new(query_text.to_string()))
            .limit(limit)
            .execute()
            .await;

        let batches: Vec<RecordBatch> = match result {
            Ok(stream) => stream.try_collect().await.unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Ok(batches_to_hits(&batches))
    }

    async fn list_ids(&self, bot_id: crate::BotId, scope: &Scope) -> Result<Vec<Uuid>> {
        let table = self.table().await?;
        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(scope_predicate(bot_id, scope))
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .try_collect()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(batches
            .iter()
            .flat_map(|b| {
                let col = b
                    .column_by_name("id")
                    .and_then(|c| c.as_any().downcast_ref::<StringArray>());
                (0..b.num_rows()).filter_map(move |i| {
                    col.and_then(|c| Uuid::parse_str(c.value(i)).ok())
                })
            })
            .collect())
    }

    fn to_batch(&self, bot_id: crate::BotId, item: &MemoryItem, vector: Vec<f32>, sparse_text: &str) -> Result<RecordBatch> {
        if vector.len() as i32 != self.vector_dim {
            return Err(IntegrityError::Constraint(format!(
                "embedding dim {} does not match table dim {}",
                vector.len(),
                self.vector_dim
            ))
            .into());
        }

        let vector_array = arrow_array::FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.vector_dim,
            Arc::new(Float32Array::from(vector)),
            None,
        )
        .map_err(|e| anyhow::anyhow!(e))?;

        RecordBatch::try_new(
            schema(self.vector_dim),
            vec![
                Arc::new(StringArray::from(vec![item.id.to_string()])),
                Arc::new(StringArray::from(vec![bot_id.to_string()])),
                Arc::new(StringArray::from(vec![item.text.clone()])),
                Arc::new(StringArray::from(vec![item.content_hash.clone()])),
                Arc::new(StringArray::from(vec![item.scope.user_id.clone()])),
                Arc::new(StringArray::from(vec![item.scope.agent_id.clone()])),
                Arc::new(StringArray::from(vec![item.scope.run_id.clone()])),
                Arc::new(StringArray::from(vec![modality_str(item.modality)])),
                Arc::new(StringArray::from(vec![item.embedding_model_id.clone()])),
                Arc::new(StringArray::from(vec![item.created_at.to_rfc3339()])),
                Arc::new(StringArray::from(vec![item.updated_at.to_rfc3339()])),
                Arc::new(vector_array),
                Arc::new(StringArray::from(vec![sparse_text.to_string()])),
            ],
        )
        .map_err(|e| anyhow::anyhow!(e).into())
    }
}

fn modality_str(m: Modality) -> &'static str {
    match m {
        Modality::Text => "text",
        Modality::Multimodal => "multimodal",
    }
}

fn scope_predicate(bot_id: crate::BotId, scope: &Scope) -> String {
    let mut clauses = vec![format!("bot_id = '{bot_id}'")];
    if let Some(u) = &scope.user_id {
        clauses.push(format!("scope_user = '{}'", escape(u)));
    }
    if let Some(a) = &scope.agent_id {
        clauses.push(format!("scope_agent = '{}'", escape(a)));
    }
    if let Some(r) = &scope.run_id {
        clauses.push(format!("scope_run = '{}'", escape(r)));
    }
    clauses.join(" AND ")
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn batches_to_hits(batches: &[RecordBatch]) -> Vec<crate::memory::types::SourceHit> {
    let mut hits = Vec::new();
    let mut rank = 0usize;
    for batch in batches {
        let Some(ids) = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        else {
            continue;
        };
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
        let scores = batch
            .column_by_name("_score")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for i in 0..batch.num_rows() {
            if let Ok(id) = Uuid::parse_str(ids.value(i)) {
                let score = distances
                    .map(|d| 1.0 - d.value(i) as f64)
                    .or_else(|| scores.map(|s| s.value(i) as f64))
                    .unwrap_or(0.0);
                hits.push(crate::memory::types::SourceHit { id, rank, score });
                rank += 1;
            }
        }
    }
    hits
}

/// Cache of open per-bot `LanceMemoryStore`s, one per `(bot_id,
/// embedding_dim)` since the vector column width is fixed per table.
pub struct LanceStoreCache {
    root: std::path::PathBuf,
    stores: tokio::sync::RwLock<HashMap<crate::BotId, Arc<LanceMemoryStore>>>,
}

impl LanceStoreCache {
    pub fn new(root: std::path::PathBuf) -> Self {
        Self {
            root,
            stores: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_open(&self, bot_id: crate::BotId, vector_dim: i32) -> Result<Arc<LanceMemoryStore>> {
        if let Some(s) = self.stores.read().await.get(&bot_id) {
            return Ok(s.clone());
        }
        let mut guard = self.stores.write().await;
        if let Some(s) = guard.get(&bot_id) {
            return Ok(s.clone());
        }
        let path = self.root.join(bot_id.to_string());
        let store = Arc::new(LanceMemoryStore::open(&path, vector_dim).await?);
        guard.insert(bot_id, store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Scope;

    fn item(bot_id: crate::BotId, scope: Scope, text: &str) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4(),
            text: text.to_string(),
            content_hash: super::super::types::hash_memory(text, &[]),
            scope,
            modality: Modality::Text,
            embedding_model_id: "fastembed/bge-small-en-v1.5".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn vector(seed: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[0] = seed;
        v
    }

    #[tokio::test]
    async fn search_dense_finds_rows_scoped_to_the_writing_bot() {
        let dir = std::env::temp_dir().join(format!("meshbot-lancestore-{}", Uuid::new_v4()));
        let store = LanceMemoryStore::open(&dir, 8).await.unwrap();

        let bot_id = crate::BotId::new();
        let scope = Scope::for_bot(bot_id);
        let mem = item(bot_id, scope.clone(), "loves pizza");
        store.upsert(bot_id, &mem, vector(1.0), "loves pizza").await.unwrap();

        let hits = store.search_dense(bot_id, &scope, vector(1.0), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, mem.id);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn delete_scope_removes_only_matching_rows() {
        let dir = std::env::temp_dir().join(format!("meshbot-lancestore-{}", Uuid::new_v4()));
        let store = LanceMemoryStore::open(&dir, 8).await.unwrap();

        let bot_id = crate::BotId::new();
        let scope_a = Scope { user_id: Some("alice".into()), ..Scope::for_bot(bot_id) };
        let scope_b = Scope { user_id: Some("bob".into()), ..Scope::for_bot(bot_id) };

        let a = item(bot_id, scope_a.clone(), "alice fact");
        let b = item(bot_id, scope_b.clone(), "bob fact");
        store.upsert(bot_id, &a, vector(1.0), "alice fact").await.unwrap();
        store.upsert(bot_id, &b, vector(2.0), "bob fact").await.unwrap();

        let deleted = store.delete_scope(bot_id, &scope_a).await.unwrap();
        assert_eq!(deleted, vec![a.id]);

        let remaining = store.search_dense(bot_id, &scope_b, vector(2.0), 5).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);

        let gone = store.search_dense(bot_id, &scope_a, vector(1.0), 5).await.unwrap();
        assert!(gone.is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
