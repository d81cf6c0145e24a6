use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::RetrievalError;
use crate::model::OpenAiClient;
use crate::types::{RetrievedSource, Source};

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Snippets of `tenant_id` scoring at least `min_similarity` against
    /// `query`, best first, at most `limit`. An empty result is not an error.
    async fn retrieve(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<RetrievedSource>, RetrievalError>;
}

/// Entry point used by the turn router. Blank queries never reach the retriever.
pub async fn retrieve_relevant_sources(
    retriever: &dyn KnowledgeRetriever,
    tenant_id: &str,
    query: &str,
    limit: usize,
    min_similarity: f64,
) -> Result<Vec<RetrievedSource>, RetrievalError> {
    let query = query.trim();
    if query.is_empty() || limit == 0 {
        return Ok(vec![]);
    }
    let hits = retriever
        .retrieve(tenant_id, query, limit, min_similarity)
        .await?;
    Ok(rank_sources(hits, min_similarity, limit))
}

/// Drops hits under the threshold, orders by similarity (newest source wins
/// ties) and truncates to `limit`.
pub fn rank_sources(
    mut hits: Vec<RetrievedSource>,
    min_similarity: f64,
    limit: usize,
) -> Vec<RetrievedSource> {
    hits.retain(|hit| hit.similarity >= min_similarity);
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.source.updated_at.cmp(&a.source.updated_at))
    });
    hits.truncate(limit);
    hits
}

fn embedding_to_pgvector(embedding: &[f32]) -> String {
    let items = embedding
        .iter()
        .map(|v| format!("{:.8}", v))
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

pub struct PgRetriever {
    db: PgPool,
    embedder: Arc<OpenAiClient>,
}

impl PgRetriever {
    pub fn new(db: PgPool, embedder: Arc<OpenAiClient>) -> Self {
        Self { db, embedder }
    }
}

#[async_trait]
impl KnowledgeRetriever for PgRetriever {
    async fn retrieve(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<RetrievedSource>, RetrievalError> {
        if !self.embedder.has_api_key() {
            tracing::debug!("embedding key missing; retrieval skipped");
            return Ok(vec![]);
        }
        let embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let Some(embedding) = embeddings.first() else {
            return Ok(vec![]);
        };
        let rows = sqlx::query(
            "SELECT id, tenant_id, title, content, url, updated_at, \
                    ((1 - (embedding <=> $2::vector))::double precision) AS similarity \
             FROM sources \
             WHERE tenant_id = $1 \
               AND embedding IS NOT NULL \
               AND (1 - (embedding <=> $2::vector)) >= $3 \
             ORDER BY embedding <=> $2::vector, updated_at DESC \
             LIMIT $4",
        )
        .bind(tenant_id)
        .bind(embedding_to_pgvector(embedding))
        .bind(min_similarity)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RetrievedSource {
                source: Source {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    title: row.get("title"),
                    content: row.get("content"),
                    url: row.get("url"),
                    updated_at: row.get("updated_at"),
                },
                similarity: row.get("similarity"),
            })
            .collect())
    }
}
