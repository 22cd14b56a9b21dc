//! Vector store queries with the access predicate pushed into SQL.
//!
//! The similarity query filters before it ranks: the access predicate is
//! evaluated over each chunk's denormalized triple inside the store query,
//! together with a staleness join requiring the chunk's triple and
//! fingerprint to still equal its parent document's. Chunks that fail
//! either test are never materialized, scored, or logged. Cosine runs in
//! Rust over the surviving rows only.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::access::AccessPredicate;
use crate::embedding::{blob_to_vec, cosine_similarity};

/// A chunk surviving the predicate + staleness filter, scored by cosine
/// similarity against the query vector.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub similarity: f64,
}

/// Nearest accessible chunks for `query_vec` within `document_ids`,
/// best-first, at most `k`.
///
/// `dims` is the system-wide embedding dimensionality; a query vector of
/// any other length is a programming error, not a runtime condition.
pub async fn similar_chunks(
    pool: &SqlitePool,
    predicate: &AccessPredicate,
    query_vec: &[f32],
    dims: usize,
    document_ids: &[String],
    k: i64,
) -> Result<Vec<ChunkHit>, sqlx::Error> {
    assert_eq!(
        query_vec.len(),
        dims,
        "query vector dimensionality mismatch"
    );

    if document_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; document_ids.len()].join(", ");
    let sql = format!(
        "SELECT c.id, c.document_id, c.chunk_index, c.text, c.embedding \
         FROM chunks c \
         JOIN documents d ON d.id = c.document_id \
         WHERE c.document_id IN ({ids}) \
           AND {clause} \
           AND c.fingerprint = d.fingerprint \
           AND c.visibility = d.visibility \
           AND c.owning_institution = d.owning_institution \
           AND c.approval_state = d.approval_state",
        ids = placeholders,
        clause = predicate.sql_clause("c."),
    );

    let mut query = sqlx::query(&sql);
    for id in document_ids {
        query = query.bind(id);
    }
    let query = predicate.bind(query);
    let rows = query.fetch_all(pool).await?;

    let mut hits: Vec<ChunkHit> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            ChunkHit {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                similarity: cosine_similarity(query_vec, &vec) as f64,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k.max(0) as usize);

    Ok(hits)
}
