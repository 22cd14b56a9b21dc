//! Lazy embedding manager: the per-document claim state machine.
//!
//! For each document the reranker selects, this module guarantees that
//! chunk embeddings exist before vector search runs, that no two workers
//! ever compute them concurrently, and that one slow or failing document
//! never blocks the rest of a query.
//!
//! The claim is the `embedding_status` column itself: transitioning out of
//! `not_embedded` (or `embedding_failed`) is an `UPDATE ... WHERE
//! embedding_status IN (...)` whose `rows_affected` decides the winner,
//! an atomic compare-and-set in durable storage, valid across processes
//! and restarts. Losers poll the status up to a bounded wait, then drop
//! the document from their own result set. Claims carry a timestamp;
//! claims older than the configured TTL are presumed dead and may be
//! taken over.
//!
//! Claimed work runs in a detached task: cancelling the query that
//! triggered it does not cancel the embedding, so the work still lands
//! for future queries.

use anyhow::{anyhow, Result};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config, EmbeddingConfig};
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::models::EmbeddingStatus;

/// What happened to one document during [`ensure_embedded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// Fresh chunks already existed.
    Ready,
    /// This call claimed the document and embedded it.
    Embedded,
    /// Embedding failed (here or in the claim winner); retryable later.
    Failed,
    /// Another worker held the claim past our wait bound; dropped from
    /// this query only.
    SkippedBusy,
    /// The per-query cold-document budget was exhausted.
    SkippedBudget,
}

impl EmbedOutcome {
    /// Whether the document has a usable chunk set after this call.
    pub fn is_available(&self) -> bool {
        matches!(self, EmbedOutcome::Ready | EmbedOutcome::Embedded)
    }
}

/// Status API for observability by the ingestion UI.
pub async fn embedding_status(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<EmbeddingStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT embedding_status FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    status.map(|s| EmbeddingStatus::parse(&s)).transpose()
}

/// Explicit re-embed request: push an embedded or failed document back to
/// `not_embedded` so the next query recomputes it.
pub async fn request_reembed(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE documents SET embedding_status = ?, embedding_error = NULL \
         WHERE id = ? AND embedding_status IN (?, ?)",
    )
    .bind(EmbeddingStatus::NotEmbedded.as_str())
    .bind(document_id)
    .bind(EmbeddingStatus::Embedded.as_str())
    .bind(EmbeddingStatus::Failed.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Make sure chunk embeddings exist for each document, computing them on
/// first need. At most `retrieval.max_embed_per_query` documents get cold
/// work; per-document failures are isolated and logged, never returned as
/// errors.
pub async fn ensure_embedded(
    pool: &SqlitePool,
    config: &Config,
    provider: &Arc<dyn EmbeddingProvider>,
    document_ids: &[String],
) -> Vec<(String, EmbedOutcome)> {
    let mut cold_budget = config.retrieval.max_embed_per_query;
    let mut outcomes = Vec::with_capacity(document_ids.len());

    for id in document_ids {
        let outcome = match ensure_one(pool, config, provider, id, &mut cold_budget).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(document_id = %id, error = %e, "embedding bookkeeping failed");
                EmbedOutcome::Failed
            }
        };
        debug!(document_id = %id, ?outcome, "lazy embedding outcome");
        outcomes.push((id.clone(), outcome));
    }

    outcomes
}

async fn ensure_one(
    pool: &SqlitePool,
    config: &Config,
    provider: &Arc<dyn EmbeddingProvider>,
    document_id: &str,
    cold_budget: &mut usize,
) -> Result<EmbedOutcome> {
    // The status can move under us (claims won elsewhere, resets from
    // re-ingestion); a handful of re-reads always reaches a terminal
    // answer for this query.
    for _ in 0..4 {
        let row = sqlx::query(
            "SELECT embedding_status, fingerprint, embedding_claimed_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            warn!(document_id, "document vanished before embedding");
            return Ok(EmbedOutcome::Failed);
        };
        let status: String = row.get("embedding_status");
        let fingerprint: String = row.get("fingerprint");
        let claimed_at: Option<i64> = row.get("embedding_claimed_at");

        match EmbeddingStatus::parse(&status)? {
            EmbeddingStatus::Embedded => {
                if chunks_fresh(pool, document_id, &fingerprint).await? {
                    return Ok(EmbedOutcome::Ready);
                }
                // Stale chunks (triple or content drift): explicit reset,
                // then fall through to claim on the next iteration.
                info!(document_id, "stale chunk set detected, resetting for re-embed");
                sqlx::query(
                    "UPDATE documents SET embedding_status = ? \
                     WHERE id = ? AND embedding_status = ?",
                )
                .bind(EmbeddingStatus::NotEmbedded.as_str())
                .bind(document_id)
                .bind(EmbeddingStatus::Embedded.as_str())
                .execute(pool)
                .await?;
            }
            EmbeddingStatus::NotEmbedded | EmbeddingStatus::Failed => {
                if *cold_budget == 0 {
                    return Ok(EmbedOutcome::SkippedBudget);
                }
                if try_claim(pool, document_id).await? {
                    *cold_budget -= 1;
                    return Ok(run_claimed_embedding(pool, config, provider, document_id).await);
                }
                // Lost the race; re-read and take the wait path.
            }
            EmbeddingStatus::InProgress => {
                let now = chrono::Utc::now().timestamp();
                let expired = claimed_at
                    .map(|t| now - t > config.retrieval.claim_ttl_secs)
                    .unwrap_or(true);
                if expired && *cold_budget > 0 && take_over_claim(pool, document_id, config).await?
                {
                    warn!(document_id, "taking over expired embedding claim");
                    *cold_budget -= 1;
                    return Ok(run_claimed_embedding(pool, config, provider, document_id).await);
                }
                return wait_for_claim(pool, config, document_id).await;
            }
        }
    }

    Ok(EmbedOutcome::SkippedBusy)
}

/// All chunks present and carrying the parent's current fingerprint and
/// access triple.
async fn chunks_fresh(pool: &SqlitePool, document_id: &str, fingerprint: &str) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            SUM(
                c.fingerprint != ?
                OR c.visibility != d.visibility
                OR c.owning_institution != d.owning_institution
                OR c.approval_state != d.approval_state
            ) AS stale
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE c.document_id = ?
        "#,
    )
    .bind(fingerprint)
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let stale: Option<i64> = row.get("stale");
    Ok(total > 0 && stale.unwrap_or(0) == 0)
}

/// The claim: atomic CAS out of a claimable state. Exactly one concurrent
/// caller sees `rows_affected == 1`.
async fn try_claim(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE documents SET embedding_status = ?, embedding_claimed_at = ? \
         WHERE id = ? AND embedding_status IN (?, ?)",
    )
    .bind(EmbeddingStatus::InProgress.as_str())
    .bind(now)
    .bind(document_id)
    .bind(EmbeddingStatus::NotEmbedded.as_str())
    .bind(EmbeddingStatus::Failed.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Refresh the claim timestamp on an expired claim. Winning this CAS makes
/// the expired claim ours.
async fn take_over_claim(pool: &SqlitePool, document_id: &str, config: &Config) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let threshold = now - config.retrieval.claim_ttl_secs;
    let result = sqlx::query(
        "UPDATE documents SET embedding_claimed_at = ? \
         WHERE id = ? AND embedding_status = ? \
         AND (embedding_claimed_at IS NULL OR embedding_claimed_at <= ?)",
    )
    .bind(now)
    .bind(document_id)
    .bind(EmbeddingStatus::InProgress.as_str())
    .bind(threshold)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Poll another worker's in-flight claim up to the configured wait bound.
async fn wait_for_claim(
    pool: &SqlitePool,
    config: &Config,
    document_id: &str,
) -> Result<EmbedOutcome> {
    let poll = Duration::from_millis(config.retrieval.claim_poll_ms.max(10));
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(config.retrieval.claim_wait_ms);

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(poll).await;
        match embedding_status(pool, document_id).await? {
            Some(EmbeddingStatus::Embedded) => return Ok(EmbedOutcome::Ready),
            Some(EmbeddingStatus::Failed) => return Ok(EmbedOutcome::Failed),
            Some(_) => {}
            None => return Ok(EmbedOutcome::Failed),
        }
    }

    debug!(document_id, "claim wait timed out, dropping document from this query");
    Ok(EmbedOutcome::SkippedBusy)
}

/// Run the claimed work in a detached task and wait for it. If the caller
/// is cancelled, the task keeps running and completes the state
/// transition for future queries.
async fn run_claimed_embedding(
    pool: &SqlitePool,
    config: &Config,
    provider: &Arc<dyn EmbeddingProvider>,
    document_id: &str,
) -> EmbedOutcome {
    let pool = pool.clone();
    let chunking = config.chunking.clone();
    let embedding = config.embedding.clone();
    let provider = Arc::clone(provider);
    let id = document_id.to_string();

    let handle = tokio::spawn(async move { embed_document(pool, chunking, embedding, provider, id).await });

    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(document_id, error = %e, "embedding task aborted");
            EmbedOutcome::Failed
        }
    }
}

/// The claimed work: chunk, embed, and atomically install the chunk set.
/// Every failure path lands in `embedding_failed` with zero new chunks.
async fn embed_document(
    pool: SqlitePool,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
    provider: Arc<dyn EmbeddingProvider>,
    document_id: String,
) -> EmbedOutcome {
    match embed_document_inner(&pool, &chunking, &embedding, &provider, &document_id).await {
        Ok(chunk_count) => {
            info!(document_id = %document_id, chunks = chunk_count, "document embedded");
            EmbedOutcome::Embedded
        }
        Err(e) => {
            warn!(document_id = %document_id, error = %e, "embedding failed");
            let marked = sqlx::query(
                "UPDATE documents SET embedding_status = ?, embedding_error = ?, \
                 embedding_claimed_at = NULL \
                 WHERE id = ? AND embedding_status = ?",
            )
            .bind(EmbeddingStatus::Failed.as_str())
            .bind(e.to_string())
            .bind(&document_id)
            .bind(EmbeddingStatus::InProgress.as_str())
            .execute(&pool)
            .await;
            if let Err(mark_err) = marked {
                warn!(document_id = %document_id, error = %mark_err, "failed to record embedding failure");
            }
            EmbedOutcome::Failed
        }
    }
}

async fn embed_document_inner(
    pool: &SqlitePool,
    chunking: &ChunkingConfig,
    embedding: &EmbeddingConfig,
    provider: &Arc<dyn EmbeddingProvider>,
    document_id: &str,
) -> Result<usize> {
    let text: Option<String> = sqlx::query_scalar("SELECT text FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    let text = text.ok_or_else(|| anyhow!("document not found"))?;

    let spans = chunk_text(chunking, &text);
    if spans.is_empty() {
        return Err(anyhow!("document has no embeddable text"));
    }

    let embed_timeout = Duration::from_secs(embedding.timeout_secs);
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(spans.len());
    for batch in spans.chunks(embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
        let batch_vectors = tokio::time::timeout(embed_timeout, provider.embed(&texts))
            .await
            .map_err(|_| anyhow!("embedding computation timed out"))??;
        if batch_vectors.len() != batch.len() {
            return Err(anyhow!(
                "provider returned {} vectors for {} chunks",
                batch_vectors.len(),
                batch.len()
            ));
        }
        for vector in &batch_vectors {
            if vector.len() != provider.dims() {
                return Err(anyhow!(
                    "provider returned {}-dim vector, expected {}",
                    vector.len(),
                    provider.dims()
                ));
            }
        }
        vectors.extend(batch_vectors);
    }

    // One transaction installs the whole chunk set, stamps each chunk with
    // the document's current triple and fingerprint, and flips the status.
    // If our claim was lost meanwhile (TTL takeover, content reset), the
    // guarded status UPDATE affects no row and the whole write rolls back.
    let mut tx = pool.begin().await?;

    let doc = sqlx::query(
        "SELECT fingerprint, visibility, owning_institution, approval_state \
         FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_one(&mut *tx)
    .await?;
    let fingerprint: String = doc.get("fingerprint");
    let visibility: String = doc.get("visibility");
    let owning_institution: String = doc.get("owning_institution");
    let approval_state: String = doc.get("approval_state");

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    let now = chrono::Utc::now().timestamp();
    for (span, vector) in spans.iter().zip(vectors.iter()) {
        sqlx::query(
            r#"
            INSERT INTO chunks
                (id, document_id, chunk_index, text, embedding, fingerprint,
                 visibility, owning_institution, approval_state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(span.index)
        .bind(&span.text)
        .bind(vec_to_blob(vector))
        .bind(&fingerprint)
        .bind(&visibility)
        .bind(&owning_institution)
        .bind(&approval_state)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let flipped = sqlx::query(
        "UPDATE documents SET embedding_status = ?, embedding_error = NULL, \
         embedding_claimed_at = NULL \
         WHERE id = ? AND embedding_status = ?",
    )
    .bind(EmbeddingStatus::Embedded.as_str())
    .bind(document_id)
    .bind(EmbeddingStatus::InProgress.as_str())
    .execute(&mut *tx)
    .await?;

    if flipped.rows_affected() != 1 {
        return Err(anyhow!("embedding claim lost before completion"));
    }

    tx.commit().await?;
    Ok(spans.len())
}
