//! Metadata extraction: raw document text → compact searchable record.
//!
//! Extraction is a pure function of the text plus the corpus-so-far term
//! statistics, run off the ingestion path. It layers three passes:
//! filename/first-line heuristics, deterministic TF-IDF keyword selection,
//! and an optional model-backed enrichment with a bounded timeout. The
//! enrichment pass may fail or time out freely; the record still lands as
//! `ready` on the heuristic fields alone.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::models::{DocumentMetadata, MetadataStatus};

/// Stopwords excluded from keyword extraction.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "has", "have", "had", "this", "that", "these",
    "those", "with", "from", "into", "onto", "over", "under", "about", "after", "before", "between",
    "their", "there", "here", "which", "while", "where", "when", "what", "whom", "whose", "will",
    "would", "shall", "should", "could", "can", "may", "might", "must", "not", "nor", "but", "its",
    "his", "her", "our", "your", "they", "them", "she", "him", "you", "all", "any", "each", "such",
    "than", "then", "also", "been", "being", "other", "more", "most", "some", "one", "two", "per",
    "via", "upon", "within", "without", "during", "through", "out", "off", "own",
];

/// Structured fields returned by the enrichment service.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub summary: Option<String>,
    pub category: Option<String>,
    pub entities: Vec<String>,
}

/// Best-effort text-understanding service. Implementations must treat every
/// failure as recoverable; the extractor never propagates enrichment errors.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, text: &str) -> Result<Enrichment>;
}

/// Instantiate the configured enricher, or `None` when disabled.
pub fn create_enricher(config: &ExtractionConfig) -> Result<Option<Box<dyn Enricher>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "model" => Ok(Some(Box::new(ModelEnricher::new(config)?))),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

/// Derive (or refresh) the metadata record for a document.
///
/// Re-extraction with an unchanged fingerprint returns the stored record
/// untouched, which makes the operation idempotent even though the TF-IDF
/// background statistics keep moving as the corpus grows.
pub async fn extract_metadata(
    pool: &SqlitePool,
    config: &ExtractionConfig,
    enricher: Option<&dyn Enricher>,
    document_id: &str,
    filename: Option<&str>,
) -> Result<DocumentMetadata> {
    let row = sqlx::query("SELECT text, fingerprint FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        bail!("document not found: {}", document_id);
    };
    let text: String = row.get("text");
    let doc_fingerprint: String = row.get("fingerprint");

    if let Some(existing) = load_metadata(pool, document_id).await? {
        if existing.status == MetadataStatus::Ready && existing.fingerprint == doc_fingerprint {
            debug!(document_id, "metadata up to date, skipping extraction");
            return Ok(existing);
        }
    }

    if text.trim().is_empty() {
        let record = write_failed(pool, document_id, &doc_fingerprint, "document text is empty")
            .await?;
        return Ok(record);
    }

    // Pass 1: cheap structural heuristics.
    let mut title = first_line_title(&text);
    if title.is_none() {
        title = filename.map(|f| f.to_string());
    }
    let mut category = sniff_department(&text);
    let mut summary = Some(leading_summary(&text));

    // Pass 2: deterministic TF-IDF keywords against the corpus so far.
    let mut keywords = keyword_terms(pool, document_id, &text, config.max_keywords).await?;

    // Pass 3: best-effort enrichment under a bounded timeout.
    if let Some(enricher) = enricher {
        let deadline = Duration::from_secs(config.timeout_secs);
        match tokio::time::timeout(deadline, enricher.enrich(&text)).await {
            Ok(Ok(enrichment)) => {
                if enrichment.summary.is_some() {
                    summary = enrichment.summary;
                }
                if enrichment.category.is_some() {
                    category = enrichment.category;
                }
                for entity in enrichment.entities {
                    let entity = entity.to_lowercase();
                    if !entity.is_empty() && !keywords.contains(&entity) {
                        keywords.push(entity);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(document_id, error = %e, "enrichment failed, keeping heuristic fields");
            }
            Err(_) => {
                warn!(document_id, "enrichment timed out, keeping heuristic fields");
            }
        }
    }

    let record = DocumentMetadata {
        document_id: document_id.to_string(),
        title,
        category,
        summary,
        keywords,
        status: MetadataStatus::Ready,
        failure_reason: None,
        fingerprint: doc_fingerprint,
        extracted_at: chrono::Utc::now().timestamp(),
    };

    store_metadata(pool, &record, &text).await?;
    Ok(record)
}

/// Load the stored metadata record, if any.
pub async fn load_metadata(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<DocumentMetadata>> {
    let row = sqlx::query(
        "SELECT document_id, title, category, summary, keywords_json, status, \
         failure_reason, fingerprint, extracted_at \
         FROM document_metadata WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let keywords_json: String = row.get("keywords_json");
    let keywords: Vec<String> = serde_json::from_str(&keywords_json).unwrap_or_default();
    let status: String = row.get("status");

    Ok(Some(DocumentMetadata {
        document_id: row.get("document_id"),
        title: row.get("title"),
        category: row.get("category"),
        summary: row.get("summary"),
        keywords,
        status: MetadataStatus::parse(&status)?,
        failure_reason: row.get("failure_reason"),
        fingerprint: row.get("fingerprint"),
        extracted_at: row.get("extracted_at"),
    }))
}

async fn write_failed(
    pool: &SqlitePool,
    document_id: &str,
    doc_fingerprint: &str,
    reason: &str,
) -> Result<DocumentMetadata> {
    let record = DocumentMetadata {
        document_id: document_id.to_string(),
        title: None,
        category: None,
        summary: None,
        keywords: Vec::new(),
        status: MetadataStatus::Failed,
        failure_reason: Some(reason.to_string()),
        fingerprint: doc_fingerprint.to_string(),
        extracted_at: chrono::Utc::now().timestamp(),
    };
    store_metadata(pool, &record, "").await?;
    warn!(document_id, reason, "metadata extraction failed");
    Ok(record)
}

/// Persist the record, refresh the lexical index row, and replace this
/// document's term set (the TF-IDF document frequencies).
async fn store_metadata(pool: &SqlitePool, record: &DocumentMetadata, text: &str) -> Result<()> {
    let keywords_json = serde_json::to_string(&record.keywords)?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO document_metadata
            (document_id, title, category, summary, keywords_json, status,
             failure_reason, fingerprint, extracted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            title = excluded.title,
            category = excluded.category,
            summary = excluded.summary,
            keywords_json = excluded.keywords_json,
            status = excluded.status,
            failure_reason = excluded.failure_reason,
            fingerprint = excluded.fingerprint,
            extracted_at = excluded.extracted_at
        "#,
    )
    .bind(&record.document_id)
    .bind(&record.title)
    .bind(&record.category)
    .bind(&record.summary)
    .bind(&keywords_json)
    .bind(record.status.as_str())
    .bind(&record.failure_reason)
    .bind(&record.fingerprint)
    .bind(record.extracted_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM metadata_fts WHERE document_id = ?")
        .bind(&record.document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO metadata_fts (document_id, title, keywords, summary) VALUES (?, ?, ?, ?)")
        .bind(&record.document_id)
        .bind(record.title.as_deref().unwrap_or(""))
        .bind(record.keywords.join(" "))
        .bind(record.summary.as_deref().unwrap_or(""))
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM document_terms WHERE document_id = ?")
        .bind(&record.document_id)
        .execute(&mut *tx)
        .await?;
    let mut terms: Vec<String> = tokenize(text).collect();
    terms.sort_unstable();
    terms.dedup();
    for term in terms {
        sqlx::query("INSERT INTO document_terms (document_id, term) VALUES (?, ?)")
            .bind(&record.document_id)
            .bind(&term)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

// ============ Heuristics ============

fn first_line_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title: String = line.chars().take(120).collect();
    Some(title.trim_start_matches('#').trim().to_string())
}

/// Scan the document head for an originating department or ministry.
fn sniff_department(text: &str) -> Option<String> {
    let head: String = text.chars().take(800).collect();
    for marker in ["Ministry of ", "Department of "] {
        if let Some(pos) = head.find(marker) {
            let rest = &head[pos..];
            let end = rest
                .find(['.', ',', '\n', ';', '('])
                .unwrap_or(rest.len())
                .min(80);
            let name = rest[..end].trim();
            if name.len() > marker.len() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Leading-sentence summary, capped in length.
fn leading_summary(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::new();
    for sentence in flat.split_inclusive(". ") {
        if !out.is_empty() && out.len() + sentence.len() > 280 {
            break;
        }
        out.push_str(sentence);
        if out.len() >= 280 {
            break;
        }
    }
    out.chars().take(300).collect::<String>().trim().to_string()
}

// ============ Keyword extraction (deterministic fallback) ============

/// Lowercase alphanumeric tokens worth indexing: words of length >= 3 and
/// 4-digit numbers (years).
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric()).filter_map(|raw| {
        let token = raw.to_lowercase();
        let is_year = token.len() == 4 && token.chars().all(|c| c.is_ascii_digit());
        let is_word = token.len() >= 3 && !token.chars().all(|c| c.is_ascii_digit());
        if (is_year || is_word) && !STOPWORDS.contains(&token.as_str()) {
            Some(token)
        } else {
            None
        }
    })
}

/// Top-N terms by TF-IDF over the corpus so far. Ties break by score, then
/// term, so the fallback path is exactly reproducible.
async fn keyword_terms(
    pool: &SqlitePool,
    document_id: &str,
    text: &str,
    max_keywords: usize,
) -> Result<Vec<String>> {
    let mut tf: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }
    if tf.is_empty() {
        return Ok(Vec::new());
    }

    let corpus_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    // Document frequencies for this document's candidate terms, excluding
    // the document itself (its own term rows may predate re-extraction).
    let mut df: HashMap<String, i64> = HashMap::new();
    let terms: Vec<&String> = tf.keys().collect();
    for batch in terms.chunks(200) {
        let placeholders = vec!["?"; batch.len()].join(", ");
        let sql = format!(
            "SELECT term, COUNT(*) AS df FROM document_terms \
             WHERE document_id != ? AND term IN ({}) GROUP BY term",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(document_id);
        for term in batch {
            query = query.bind(term.as_str());
        }
        for row in query.fetch_all(pool).await? {
            let term: String = row.get("term");
            let count: i64 = row.get("df");
            df.insert(term, count);
        }
    }

    let n = corpus_docs.max(1) as f64;
    let mut scored: Vec<(f64, String)> = tf
        .into_iter()
        .map(|(term, count)| {
            let term_df = df.get(&term).copied().unwrap_or(0) as f64;
            let idf = (1.0 + n / (1.0 + term_df)).ln();
            (count as f64 * idf, term)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.truncate(max_keywords);

    Ok(scored.into_iter().map(|(_, term)| term).collect())
}

// ============ Model-backed enricher ============

/// Enrichment via a chat-completions style endpoint that returns JSON
/// content with `summary`, `category`, and `entities` fields.
pub struct ModelEnricher {
    model: String,
    api_base: String,
    timeout: Duration,
}

impl ModelEnricher {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.model required for model provider"))?;
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
impl Enricher for ModelEnricher {
    async fn enrich(&self, text: &str) -> Result<Enrichment> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let excerpt: String = text.chars().take(6000).collect();
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                {
                    "role": "system",
                    "content": "Extract document metadata. Reply with JSON only: \
                                {\"summary\": string, \"category\": string, \"entities\": [string]}"
                },
                { "role": "user", "content": excerpt }
            ],
        });

        let response = client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let json: Value = response.json().await?;
        parse_enrichment(&json)
    }
}

fn parse_enrichment(json: &Value) -> Result<Enrichment> {
    let content = json
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("enrichment response missing content"))?;

    let parsed: Value = serde_json::from_str(content)
        .map_err(|_| anyhow::anyhow!("enrichment content is not valid JSON"))?;

    Ok(Enrichment {
        summary: parsed
            .get("summary")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        category: parsed
            .get("category")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        entities: parsed
            .get("entities")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
    })
}
