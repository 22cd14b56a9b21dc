use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Documents: raw text, content fingerprint, access triple, and the
    // embedding claim cell (status + claim timestamp).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            visibility TEXT NOT NULL,
            owning_institution TEXT NOT NULL,
            approval_state TEXT NOT NULL,
            embedding_status TEXT NOT NULL DEFAULT 'not_embedded',
            embedding_error TEXT,
            embedding_claimed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_metadata (
            document_id TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
            title TEXT,
            category TEXT,
            summary TEXT,
            keywords_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            failure_reason TEXT,
            fingerprint TEXT NOT NULL,
            extracted_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks carry the embedding BLOB plus a denormalized copy of the
    // parent's access triple and fingerprint (staleness check).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            fingerprint TEXT NOT NULL,
            visibility TEXT NOT NULL,
            owning_institution TEXT NOT NULL,
            approval_state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-document term sets backing TF-IDF document frequencies; replaced
    // wholesale on re-extraction so frequencies never drift.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_terms (
            document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            term TEXT NOT NULL,
            PRIMARY KEY (document_id, term)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_document_terms_term ON document_terms(term)")
        .execute(pool)
        .await?;

    // FTS5 virtual table over metadata fields.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='metadata_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE metadata_fts USING fts5(
                document_id UNINDEXED,
                title,
                keywords,
                summary
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_embedding_status ON documents(embedding_status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
