//! Lexical candidate filter: BM25 shortlisting over metadata.
//!
//! One relational query does the whole stage: the FTS5 `MATCH` and the
//! access predicate sit in the same `WHERE`, so inaccessible documents are
//! filtered inside the store: their scores are never computed, returned,
//! or logged. Free text is sanitized into a quoted OR expression first;
//! FTS5 operator syntax cannot be injected through a query string.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::access::AccessPredicate;
use crate::extract::tokenize;

/// A shortlisted document with its raw lexical score (higher is better).
#[derive(Debug, Clone)]
pub struct LexicalCandidate {
    pub document_id: String,
    pub score: f64,
}

/// BM25 column weights for (document_id, title, keywords, summary).
const BM25_WEIGHTS: &str = "0.0, 3.0, 2.0, 1.0";

/// Shortlist up to `limit` accessible documents for `query`. Returns an
/// empty list (not an error) when nothing matches or the query carries no
/// indexable terms.
pub async fn lexical_candidates(
    pool: &SqlitePool,
    predicate: &AccessPredicate,
    query: &str,
    limit: i64,
) -> Result<Vec<LexicalCandidate>, sqlx::Error> {
    let Some(match_expr) = fts_match_expr(query) else {
        return Ok(Vec::new());
    };

    let sql = format!(
        "SELECT metadata_fts.document_id AS document_id, \
                bm25(metadata_fts, {weights}) AS lexical_rank \
         FROM metadata_fts \
         JOIN documents d ON d.id = metadata_fts.document_id \
         WHERE metadata_fts MATCH ? AND {clause} \
         ORDER BY lexical_rank \
         LIMIT ?",
        weights = BM25_WEIGHTS,
        clause = predicate.sql_clause("d."),
    );

    let query = sqlx::query(&sql).bind(match_expr);
    let query = predicate.bind(query).bind(limit);
    let rows = query.fetch_all(pool).await?;

    let candidates = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("lexical_rank");
            LexicalCandidate {
                document_id: row.get("document_id"),
                // bm25() is smaller-is-better; negate so higher = better.
                score: -rank,
            }
        })
        .collect();

    Ok(candidates)
}

/// Build a safe FTS5 match expression: each distinct term double-quoted,
/// joined with OR. `None` when no indexable term survives tokenization.
pub fn fts_match_expr(query: &str) -> Option<String> {
    let mut terms: Vec<String> = tokenize(query).collect();
    terms.sort_unstable();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expr_quotes_and_ors_terms() {
        let expr = fts_match_expr("Higher education funding").unwrap();
        assert_eq!(expr, "\"education\" OR \"funding\" OR \"higher\"");
    }

    #[test]
    fn match_expr_survives_fts_operators() {
        // Punctuation and operator tokens must come out quoted or dropped.
        let expr = fts_match_expr("funding AND (reforms) \"quoted\" near/2").unwrap();
        assert!(!expr.contains('('));
        assert!(expr.contains("\"reforms\""));
        assert!(expr.contains("\"funding\""));
    }

    #[test]
    fn empty_and_stopword_queries_have_no_expr() {
        assert!(fts_match_expr("").is_none());
        assert!(fts_match_expr("  the of a ").is_none());
        assert!(fts_match_expr("?!").is_none());
    }
}
