//! Relevance reranking of the lexical shortlist.
//!
//! A [`Reranker`] scores (query, candidate-metadata) pairs into `[0, 1]`.
//! Two implementations: a model-backed scorer calling a remote rerank API,
//! and a deterministic local term-overlap scorer. Strategy selection
//! happens once at construction ([`create_reranker`]); the pipeline keeps
//! the lexical scorer as a fallback and swaps to it when the primary
//! errors, so callers never observe the branch.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use crate::config::RerankConfig;
use crate::extract::tokenize;
use crate::lexical::LexicalCandidate;

/// Metadata fields a reranker sees for one candidate. Tolerates records
/// still mid-extraction: absent fields score on whatever exists.
#[derive(Debug, Clone)]
pub struct CandidateDoc {
    pub document_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    /// Raw lexical score from the candidate filter; the rerank tie-breaker.
    pub lexical_score: f64,
}

/// A reranked document: relevance in `[0, 1]` plus the lexical score it
/// entered with.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub document_id: String,
    pub relevance: f64,
    pub lexical_score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;
    /// One score per candidate, in candidate order, each in `[0, 1]`.
    async fn score(&self, query: &str, candidates: &[CandidateDoc]) -> Result<Vec<f64>>;
}

/// Instantiate the configured strategy.
pub fn create_reranker(config: &RerankConfig) -> Result<Box<dyn Reranker>> {
    match config.strategy.as_str() {
        "lexical" => Ok(Box::new(LexicalReranker)),
        "model" => Ok(Box::new(ModelReranker::new(config)?)),
        other => bail!("Unknown rerank strategy: {}", other),
    }
}

/// Load candidate metadata and rank the shortlist down to `limit`
/// documents. Falls back to [`LexicalReranker`] when the primary scorer
/// errors, so the pipeline never stalls on a rerank dependency. Ordering is
/// deterministic: relevance desc, then lexical score desc, then id.
pub async fn rerank_candidates(
    pool: &SqlitePool,
    reranker: &dyn Reranker,
    query: &str,
    candidates: &[LexicalCandidate],
    limit: usize,
) -> Result<Vec<RankedCandidate>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let docs = load_candidate_docs(pool, candidates).await?;

    let scores = match reranker.score(query, &docs).await {
        Ok(scores) if scores.len() == docs.len() => scores,
        Ok(scores) => {
            warn!(
                reranker = reranker.name(),
                expected = docs.len(),
                got = scores.len(),
                "reranker returned wrong score count, using lexical fallback"
            );
            LexicalReranker.score(query, &docs).await?
        }
        Err(e) => {
            warn!(reranker = reranker.name(), error = %e, "reranker failed, using lexical fallback");
            LexicalReranker.score(query, &docs).await?
        }
    };

    let mut ranked: Vec<RankedCandidate> = docs
        .iter()
        .zip(scores)
        .map(|(doc, relevance)| RankedCandidate {
            document_id: doc.document_id.clone(),
            relevance: relevance.clamp(0.0, 1.0),
            lexical_score: doc.lexical_score,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.lexical_score
                    .partial_cmp(&a.lexical_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    ranked.truncate(limit);

    Ok(ranked)
}

async fn load_candidate_docs(
    pool: &SqlitePool,
    candidates: &[LexicalCandidate],
) -> Result<Vec<CandidateDoc>> {
    let placeholders = vec!["?"; candidates.len()].join(", ");
    let sql = format!(
        "SELECT document_id, title, summary, keywords_json \
         FROM document_metadata WHERE document_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for candidate in candidates {
        query = query.bind(&candidate.document_id);
    }
    let rows = query.fetch_all(pool).await?;

    // Preserve candidate order (the lexical ranking).
    let mut docs = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let row = rows.iter().find(|r| {
            let id: String = r.get("document_id");
            id == candidate.document_id
        });
        let (title, summary, keywords) = match row {
            Some(row) => {
                let keywords_json: String = row.get("keywords_json");
                (
                    row.get("title"),
                    row.get("summary"),
                    serde_json::from_str(&keywords_json).unwrap_or_default(),
                )
            }
            None => (None, None, Vec::new()),
        };
        docs.push(CandidateDoc {
            document_id: candidate.document_id.clone(),
            title,
            summary,
            keywords,
            lexical_score: candidate.score,
        });
    }
    Ok(docs)
}

// ============ Deterministic local strategy ============

/// Term-overlap scorer: the fraction of query terms found in each metadata
/// field, weighted keywords > title > summary. Exactly reproducible.
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn score(&self, query: &str, candidates: &[CandidateDoc]) -> Result<Vec<f64>> {
        let query_terms: HashSet<String> = tokenize(query).collect();
        Ok(candidates
            .iter()
            .map(|doc| {
                if query_terms.is_empty() {
                    return 0.0;
                }
                let keyword_terms: HashSet<String> =
                    doc.keywords.iter().map(|k| k.to_lowercase()).collect();
                let title_terms: HashSet<String> =
                    doc.title.as_deref().map(|t| tokenize(t).collect()).unwrap_or_default();
                let summary_terms: HashSet<String> =
                    doc.summary.as_deref().map(|s| tokenize(s).collect()).unwrap_or_default();

                let overlap = |field: &HashSet<String>| {
                    query_terms.intersection(field).count() as f64 / query_terms.len() as f64
                };

                0.5 * overlap(&keyword_terms) + 0.3 * overlap(&title_terms)
                    + 0.2 * overlap(&summary_terms)
            })
            .collect())
    }
}

// ============ Model-backed strategy ============

/// Remote scoring API: query + candidate summaries in, relevance scores
/// out, aligned by index.
pub struct ModelReranker {
    model: String,
    api_base: String,
    timeout: Duration,
}

impl ModelReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.model required for model strategy"))?;
        Ok(Self {
            model,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl Reranker for ModelReranker {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn score(&self, query: &str, candidates: &[CandidateDoc]) -> Result<Vec<f64>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let documents: Vec<String> = candidates
            .iter()
            .map(|doc| {
                let mut parts = Vec::new();
                if let Some(title) = &doc.title {
                    parts.push(title.clone());
                }
                if !doc.keywords.is_empty() {
                    parts.push(doc.keywords.join(", "));
                }
                if let Some(summary) = &doc.summary {
                    parts.push(summary.clone());
                }
                parts.join(" | ")
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });

        let response = client
            .post(format!("{}/rerank", self.api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let json: Value = response.json().await?;
        parse_rerank_response(&json, candidates.len())
    }
}

/// Parse a rerank response, aligning scores to candidate order via the
/// per-result `index` field.
fn parse_rerank_response(json: &Value, doc_count: usize) -> Result<Vec<f64>> {
    let mut scores = vec![0.0f64; doc_count];
    let results = json
        .get("results")
        .or_else(|| json.get("data"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("rerank response missing results array"))?;

    for item in results {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow::anyhow!("rerank result missing index"))? as usize;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("rerank result missing score"))?;
        if index < scores.len() {
            scores[index] = score.clamp(0.0, 1.0);
        }
    }

    Ok(scores)
}
