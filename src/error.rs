//! Query-boundary error taxonomy.
//!
//! Only infrastructure failures of the shared stores abort a query.
//! Everything scoped to a single document (extraction degradation,
//! embedding failure, claim timeout) is isolated inside the pipeline,
//! logged with the document id, and surfaces as an absent result, never
//! as an error. Access denial is not an error at any layer: inaccessible
//! documents simply never enter the candidate set.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The lexical index could not be queried.
    #[error("lexical index unavailable: {0}")]
    Index(#[source] sqlx::Error),

    /// The chunk/vector store could not be queried.
    #[error("vector store unavailable: {0}")]
    VectorStore(#[source] sqlx::Error),

    /// Reading candidate metadata or result rows failed.
    #[error("document store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}
