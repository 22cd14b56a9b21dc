//! Document intake: the contract surface consumed from the ingestion
//! collaborator.
//!
//! Ingestion supplies `(document_id, raw_text, content_fingerprint,
//! access_triple)` on creation and on later changes. This module records
//! those facts and maintains the derived-state consequences: a changed
//! fingerprint explicitly resets the embedding state and drops the chunk
//! set; a changed triple leaves chunks in place but detectably stale.
//! Writes are scoped to one document id per transaction, so cross-document
//! writes never contend.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::{AccessTriple, EmbeddingStatus, MetadataStatus};

/// Content fingerprint as the ingestion collaborator computes it.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Create or update a document. New documents start `not_embedded` with a
/// provisional `processing` metadata row (filename-derived title) so the
/// query path always has fields to read. A changed fingerprint resets the
/// embedding lifecycle and deletes the old chunk set; an unchanged
/// fingerprint updates only the access triple.
pub async fn upsert_document(
    pool: &SqlitePool,
    id: &str,
    text: &str,
    content_fingerprint: &str,
    access: &AccessTriple,
    filename: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let existing: Option<String> =
        sqlx::query_scalar("SELECT fingerprint FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    match existing {
        None => {
            sqlx::query(
                r#"
                INSERT INTO documents
                    (id, text, fingerprint, visibility, owning_institution, approval_state,
                     embedding_status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(text)
            .bind(content_fingerprint)
            .bind(access.visibility.as_str())
            .bind(&access.owning_institution)
            .bind(access.approval.as_str())
            .bind(EmbeddingStatus::NotEmbedded.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let title = filename.map(title_from_filename);
            sqlx::query(
                r#"
                INSERT INTO document_metadata
                    (document_id, title, status, fingerprint, extracted_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&title)
            .bind(MetadataStatus::Processing.as_str())
            .bind(content_fingerprint)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO metadata_fts (document_id, title, keywords, summary) VALUES (?, ?, '', '')",
            )
            .bind(id)
            .bind(title.as_deref().unwrap_or(""))
            .execute(&mut *tx)
            .await?;
        }
        Some(old_fingerprint) if old_fingerprint == content_fingerprint => {
            sqlx::query(
                r#"
                UPDATE documents
                SET visibility = ?, owning_institution = ?, approval_state = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(access.visibility.as_str())
            .bind(&access.owning_institution)
            .bind(access.approval.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        Some(_) => {
            // Content changed: explicit reset of the embedding lifecycle,
            // old chunks dropped, metadata queued for re-extraction. The
            // stale lexical index entry survives one query cycle.
            sqlx::query(
                r#"
                UPDATE documents
                SET text = ?, fingerprint = ?, visibility = ?, owning_institution = ?,
                    approval_state = ?, embedding_status = ?, embedding_error = NULL,
                    embedding_claimed_at = NULL, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(text)
            .bind(content_fingerprint)
            .bind(access.visibility.as_str())
            .bind(&access.owning_institution)
            .bind(access.approval.as_str())
            .bind(EmbeddingStatus::NotEmbedded.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE document_metadata SET status = ?, fingerprint = ?, failure_reason = NULL \
                 WHERE document_id = ?",
            )
            .bind(MetadataStatus::Processing.as_str())
            .bind(content_fingerprint)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Record an access-triple change from the ingestion collaborator
/// (re-approval, visibility change). Chunks embedded under the old triple
/// become stale; the staleness join excludes them until re-embedding.
pub async fn update_access(pool: &SqlitePool, id: &str, access: &AccessTriple) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET visibility = ?, owning_institution = ?, approval_state = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(access.visibility.as_str())
    .bind(&access.owning_institution)
    .bind(access.approval.as_str())
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete a document and everything derived from it.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM metadata_fts WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    // Metadata and chunks cascade.
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() == 1)
}

fn title_from_filename(filename: &str) -> String {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    let stem = base.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(base);
    stem.replace(['_', '-'], " ").trim().to_string()
}
