//! The query pipeline and hybrid scorer.
//!
//! `run_query` is the sole search entry point: access predicate → lexical
//! shortlist → rerank → lazy embed → vector search → hybrid merge. Stages
//! run cheap-to-expensive; only the lazy-embed stage performs long-running
//! work, and only for documents the reranker actually selected.
//! Per-document failures drop that document and are logged; only store
//! failures abort the query.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::access::AccessPredicate;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::QueryError;
use crate::lazy;
use crate::lexical::{self, LexicalCandidate};
use crate::models::{Principal, SearchResult};
use crate::rerank::{self, RankedCandidate, Reranker};
use crate::vector::{self, ChunkHit};

/// Answer `query` for `principal`. Synchronous from the caller's view; the
/// lazy-embedding side effect is hidden inside.
pub async fn run_query(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&Arc<dyn EmbeddingProvider>>,
    reranker: &dyn Reranker,
    query: &str,
    principal: &Principal,
) -> Result<Vec<SearchResult>, QueryError> {
    let predicate = AccessPredicate::from_principal(principal);

    // Stage 1: lexical shortlist, predicate pre-filtered in the store.
    let candidates =
        lexical::lexical_candidates(pool, &predicate, query, config.retrieval.candidate_limit)
            .await
            .map_err(QueryError::Index)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    debug!(candidates = candidates.len(), "lexical shortlist");

    // Stage 2: rerank down to the final document set.
    let ranked = rerank::rerank_candidates(
        pool,
        reranker,
        query,
        &candidates,
        config.retrieval.final_limit as usize,
    )
    .await?;

    // Stages 3-4: lazy embedding + vector search, skipped without a provider.
    let vector_hits = match embedder {
        Some(provider) => {
            vector_stage(pool, config, provider, &predicate, query, &ranked).await?
        }
        None => Vec::new(),
    };

    merge_results(pool, config, &candidates, &ranked, &vector_hits).await
}

/// Ensure embeddings for the selected documents, embed the query, and run
/// the predicate-filtered similarity search. A query-embedding failure
/// degrades the whole query to lexical scoring rather than failing it.
async fn vector_stage(
    pool: &SqlitePool,
    config: &Config,
    provider: &Arc<dyn EmbeddingProvider>,
    predicate: &AccessPredicate,
    query: &str,
    ranked: &[RankedCandidate],
) -> Result<Vec<ChunkHit>, QueryError> {
    let ids: Vec<String> = ranked.iter().map(|r| r.document_id.clone()).collect();
    let outcomes = lazy::ensure_embedded(pool, config, provider, &ids).await;
    let available: Vec<String> = outcomes
        .into_iter()
        .filter(|(_, outcome)| outcome.is_available())
        .map(|(id, _)| id)
        .collect();
    if available.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = match provider.embed(&[query.to_string()]).await {
        Ok(mut vecs) if !vecs.is_empty() => vecs.remove(0),
        Ok(_) => {
            warn!("query embedding returned no vector, degrading to lexical scoring");
            return Ok(Vec::new());
        }
        Err(e) => {
            warn!(error = %e, "query embedding failed, degrading to lexical scoring");
            return Ok(Vec::new());
        }
    };

    vector::similar_chunks(
        pool,
        predicate,
        &query_vec,
        provider.dims(),
        &available,
        config.retrieval.vector_k,
    )
    .await
    .map_err(QueryError::VectorStore)
}

/// Min-max normalize raw scores to `[0, 1]`.
fn normalize<'a, T>(items: &'a [T], raw: impl Fn(&T) -> f64) -> Vec<(&'a T, f64)> {
    if items.is_empty() {
        return Vec::new();
    }
    let min = items.iter().map(&raw).fold(f64::INFINITY, f64::min);
    let max = items.iter().map(&raw).fold(f64::NEG_INFINITY, f64::max);
    items
        .iter()
        .map(|item| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (raw(item) - min) / (max - min)
            };
            (item, norm)
        })
        .collect()
}

/// Merge the lexical and vector signals into one ranked, cited list.
async fn merge_results(
    pool: &SqlitePool,
    config: &Config,
    candidates: &[LexicalCandidate],
    ranked: &[RankedCandidate],
    vector_hits: &[ChunkHit],
) -> Result<Vec<SearchResult>, QueryError> {
    // Normalized lexical score per candidate document.
    let lexical_norm: HashMap<&str, f64> = normalize(candidates, |c| c.score)
        .into_iter()
        .map(|(c, s)| (c.document_id.as_str(), s))
        .collect();

    // Best chunk per document by normalized similarity.
    struct BestChunk<'a> {
        hit: &'a ChunkHit,
        score: f64,
    }
    let mut best_chunks: HashMap<&str, BestChunk> = HashMap::new();
    for (hit, score) in normalize(vector_hits, |h| h.similarity) {
        let entry = best_chunks
            .entry(hit.document_id.as_str())
            .or_insert(BestChunk { hit, score });
        if score > entry.score {
            *entry = BestChunk { hit, score };
        }
    }

    // Vector-dominant weighted sum; renormalize to pure lexical when the
    // vector signal is absent for this query.
    let vector_weight = if vector_hits.is_empty() {
        0.0
    } else {
        config.retrieval.vector_weight
    };

    let mut results = Vec::with_capacity(ranked.len());
    for candidate in ranked {
        let id = candidate.document_id.as_str();
        let lexical_score = lexical_norm.get(id).copied().unwrap_or(0.0);
        let best = best_chunks.get(id);
        let vector_score = best.map(|b| b.score).unwrap_or(0.0);
        let score = vector_weight * vector_score + (1.0 - vector_weight) * lexical_score;

        let (chunk_index, excerpt) = match best {
            Some(b) => (Some(b.hit.chunk_index), b.hit.text.clone()),
            None => (None, fallback_excerpt(pool, id).await?),
        };

        results.push(SearchResult {
            document_id: candidate.document_id.clone(),
            title: result_title(pool, id).await?,
            chunk_index,
            excerpt,
            score,
            lexical_score,
            vector_score,
        });
    }

    // Deterministic: score desc, then id asc.
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });

    Ok(results)
}

async fn result_title(pool: &SqlitePool, document_id: &str) -> Result<Option<String>, QueryError> {
    let title: Option<Option<String>> =
        sqlx::query_scalar("SELECT title FROM document_metadata WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await
            .map_err(QueryError::Index)?;
    Ok(title.flatten())
}

/// Excerpt for a document scored without a chunk hit: its summary, else
/// the head of its text.
async fn fallback_excerpt(pool: &SqlitePool, document_id: &str) -> Result<String, QueryError> {
    let row = sqlx::query(
        "SELECT m.summary, substr(d.text, 1, 240) AS head \
         FROM documents d \
         LEFT JOIN document_metadata m ON m.document_id = d.id \
         WHERE d.id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await
    .map_err(QueryError::Index)?;

    Ok(row
        .and_then(|r| {
            let summary: Option<String> = r.get("summary");
            summary.or_else(|| r.get("head"))
        })
        .unwrap_or_default())
}
