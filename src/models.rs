//! Core data models used throughout docgate.
//!
//! These types represent the documents, metadata records, chunks, and
//! principals that flow through the intake and retrieval pipeline.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Who may see a document: its visibility class, owning institution, and
/// approval state. Denormalized verbatim onto every chunk at embedding time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTriple {
    pub visibility: Visibility,
    pub owning_institution: String,
    pub approval: ApprovalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Internal,
    Confidential,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
            Visibility::Confidential => "confidential",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Visibility::Public),
            "internal" => Ok(Visibility::Internal),
            "confidential" => Ok(Visibility::Confidential),
            other => bail!("unknown visibility: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Draft,
    Pending,
    Approved,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Draft => "draft",
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(ApprovalState::Draft),
            "pending" => Ok(ApprovalState::Pending),
            "approved" => Ok(ApprovalState::Approved),
            other => bail!("unknown approval state: '{}'", other),
        }
    }
}

/// Clearance level of a requesting principal, ordered student < staff < ministry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Clearance {
    Student,
    Staff,
    Ministry,
}

impl Clearance {
    /// Numeric rank used in SQL comparisons (student=1, staff=2, ministry=3).
    pub fn rank(&self) -> i64 {
        match self {
            Clearance::Student => 1,
            Clearance::Staff => 2,
            Clearance::Ministry => 3,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "student" => Ok(Clearance::Student),
            "staff" => Ok(Clearance::Staff),
            "ministry" => Ok(Clearance::Ministry),
            other => bail!("unknown clearance: '{}'", other),
        }
    }
}

/// An already-authenticated identity, as supplied by the session collaborator.
#[derive(Debug, Clone)]
pub struct Principal {
    pub institution: String,
    pub clearance: Clearance,
}

/// Per-document embedding lifecycle. Stored as a column on `documents`;
/// the `not_embedded → embedding_in_progress` transition is the durable
/// claim taken by exactly one query worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingStatus {
    NotEmbedded,
    InProgress,
    Embedded,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::NotEmbedded => "not_embedded",
            EmbeddingStatus::InProgress => "embedding_in_progress",
            EmbeddingStatus::Embedded => "embedded",
            EmbeddingStatus::Failed => "embedding_failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "not_embedded" => Ok(EmbeddingStatus::NotEmbedded),
            "embedding_in_progress" => Ok(EmbeddingStatus::InProgress),
            "embedded" => Ok(EmbeddingStatus::Embedded),
            "embedding_failed" => Ok(EmbeddingStatus::Failed),
            other => bail!("unknown embedding status: '{}'", other),
        }
    }
}

/// Metadata extraction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStatus {
    Processing,
    Ready,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Processing => "processing",
            MetadataStatus::Ready => "ready",
            MetadataStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(MetadataStatus::Processing),
            "ready" => Ok(MetadataStatus::Ready),
            "failed" => Ok(MetadataStatus::Failed),
            other => bail!("unknown metadata status: '{}'", other),
        }
    }
}

/// A stored document: raw extracted text plus the access triple and
/// embedding state. Text and fingerprint are owned by the ingestion
/// collaborator; this engine mutates only the embedding columns.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub fingerprint: String,
    pub access: AccessTriple,
    pub embedding_status: EmbeddingStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Structured, cheaply-searchable record derived from a document's text.
#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub status: MetadataStatus,
    pub failure_reason: Option<String>,
    /// Fingerprint of the text this record was derived from.
    pub fingerprint: String,
    pub extracted_at: i64,
}

/// A contiguous slice of a document's text with its embedding vector and a
/// denormalized copy of the parent's access triple at creation time.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
    /// Parent fingerprint at creation time; a mismatch marks the chunk stale.
    pub fingerprint: String,
    pub access: AccessTriple,
}

/// One ranked result returned by the query pipeline, citing its source.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document_id: String,
    pub title: Option<String>,
    /// Index of the best-matching chunk, when vector search contributed.
    pub chunk_index: Option<i64>,
    /// Text span of the matching chunk (or the metadata summary when the
    /// document was scored lexically only).
    pub excerpt: String,
    pub score: f64,
    pub lexical_score: f64,
    pub vector_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            EmbeddingStatus::NotEmbedded,
            EmbeddingStatus::InProgress,
            EmbeddingStatus::Embedded,
            EmbeddingStatus::Failed,
        ] {
            assert_eq!(EmbeddingStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(EmbeddingStatus::parse("bogus").is_err());
    }

    #[test]
    fn clearance_ordering() {
        assert!(Clearance::Student < Clearance::Staff);
        assert!(Clearance::Staff < Clearance::Ministry);
        assert_eq!(Clearance::Ministry.rank(), 3);
    }
}
