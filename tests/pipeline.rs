//! End-to-end pipeline tests: intake → extraction → query → lazy
//! embedding → access-filtered results, all against a throwaway SQLite
//! database with the deterministic hash embedder.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use docgate::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, ExtractionConfig, RerankConfig,
    RetrievalConfig,
};
use docgate::embedding::{EmbeddingProvider, HashProvider};
use docgate::lazy::{self, EmbedOutcome};
use docgate::lexical;
use docgate::models::{
    AccessTriple, ApprovalState, Clearance, EmbeddingStatus, MetadataStatus, Principal, Visibility,
};
use docgate::rerank::LexicalReranker;
use docgate::vector;
use docgate::{db, extract, ingest, migrate, search};
use docgate::access::AccessPredicate;

const DIMS: usize = 128;

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("docgate.sqlite"),
        },
        chunking: ChunkingConfig {
            target_chunks: 8,
            min_chunk_chars: 80,
            max_chunk_chars: 400,
            overlap_divisor: 8,
        },
        retrieval: RetrievalConfig {
            claim_wait_ms: 2_000,
            claim_poll_ms: 20,
            ..Default::default()
        },
        extraction: ExtractionConfig::default(),
        rerank: RerankConfig::default(),
        embedding: EmbeddingConfig {
            provider: "hash".to_string(),
            dims: DIMS,
            ..Default::default()
        },
    }
}

async fn setup() -> (tempfile::TempDir, SqlitePool, Config) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (dir, pool, cfg)
}

fn triple(visibility: Visibility, institution: &str, approval: ApprovalState) -> AccessTriple {
    AccessTriple {
        visibility,
        owning_institution: institution.to_string(),
        approval,
    }
}

fn public_triple(institution: &str) -> AccessTriple {
    triple(Visibility::Public, institution, ApprovalState::Approved)
}

fn principal(institution: &str, clearance: Clearance) -> Principal {
    Principal {
        institution: institution.to_string(),
        clearance,
    }
}

async fn ingest_and_extract(
    pool: &SqlitePool,
    cfg: &Config,
    id: &str,
    text: &str,
    access: &AccessTriple,
) {
    ingest::upsert_document(pool, id, text, &ingest::fingerprint(text), access, None)
        .await
        .unwrap();
    extract::extract_metadata(pool, &cfg.extraction, None, id, None)
        .await
        .unwrap();
}

fn hash_provider() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashProvider::new(DIMS))
}

// ============ Test providers ============

/// Wraps the hash embedder, counting batch calls and optionally sleeping
/// or failing after a number of successful calls.
struct ProbeProvider {
    inner: HashProvider,
    calls: AtomicUsize,
    delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl ProbeProvider {
    fn counting() -> Self {
        Self {
            inner: HashProvider::new(DIMS),
            calls: AtomicUsize::new(0),
            delay: None,
            fail_after: None,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::counting()
        }
    }

    fn failing_after(successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            ..Self::counting()
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ProbeProvider {
    fn model_name(&self) -> &str {
        "probe"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(limit) = self.fail_after {
            if call >= limit {
                anyhow::bail!("injected embedding failure");
            }
        }
        self.inner.embed(texts).await
    }
}

const POLICY_TEXT: &str =
    "National Education Policy 2024 outlines reforms in higher education funding.";

// ============ Scenario A: metadata extraction ============

#[tokio::test]
async fn scenario_a_extraction_yields_keywords_and_cold_status() {
    let (_dir, pool, cfg) = setup().await;
    let access = public_triple("ministry_42");
    ingest::upsert_document(
        &pool,
        "doc-a",
        POLICY_TEXT,
        &ingest::fingerprint(POLICY_TEXT),
        &access,
        Some("national_education_policy.txt"),
    )
    .await
    .unwrap();

    let metadata = extract::extract_metadata(&pool, &cfg.extraction, None, "doc-a", None)
        .await
        .unwrap();

    assert_eq!(metadata.status, MetadataStatus::Ready);
    for expected in ["education", "policy", "2024"] {
        assert!(
            metadata.keywords.iter().any(|k| k == expected),
            "missing keyword {:?} in {:?}",
            expected,
            metadata.keywords
        );
    }
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::NotEmbedded)
    );
}

#[tokio::test]
async fn reextraction_on_unchanged_text_is_idempotent() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let first = extract::extract_metadata(&pool, &cfg.extraction, None, "doc-a", None)
        .await
        .unwrap();

    // Grow the corpus; document frequencies move, the stored record must not.
    ingest_and_extract(
        &pool,
        &cfg,
        "doc-b",
        "Education budget circular for vocational training institutes.",
        &public_triple("ministry_42"),
    )
    .await;

    let second = extract::extract_metadata(&pool, &cfg.extraction, None, "doc-a", None)
        .await
        .unwrap();
    assert_eq!(first.keywords, second.keywords);
    assert_eq!(first.category, second.category);
    assert_eq!(first.extracted_at, second.extracted_at);
}

#[tokio::test]
async fn empty_document_fails_extraction_gracefully() {
    let (_dir, pool, cfg) = setup().await;
    ingest::upsert_document(&pool, "doc-e", "   ", &ingest::fingerprint("   "), &public_triple("x"), None)
        .await
        .unwrap();
    let metadata = extract::extract_metadata(&pool, &cfg.extraction, None, "doc-e", None)
        .await
        .unwrap();
    assert_eq!(metadata.status, MetadataStatus::Failed);
    assert!(metadata.failure_reason.is_some());
}

// ============ Scenario B: full pipeline ============

#[tokio::test]
async fn scenario_b_query_embeds_lazily_and_cites_document() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;
    ingest_and_extract(
        &pool,
        &cfg,
        "doc-x",
        "Unrelated submarine sonar calibration manual for naval engineers.",
        &public_triple("navy_1"),
    )
    .await;

    let provider = hash_provider();
    let results = search::run_query(
        &pool,
        &cfg,
        Some(&provider),
        &LexicalReranker,
        "higher education funding reforms",
        &principal("institution_7", Clearance::Student),
    )
    .await
    .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].document_id, "doc-a");
    assert!(results[0].chunk_index.is_some());
    assert!(results[0].excerpt.contains("education"));
    assert!(results[0].score > 0.0);

    // The lazy side effect landed durably.
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::Embedded)
    );
}

#[tokio::test]
async fn query_without_embedder_degrades_to_lexical() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let results = search::run_query(
        &pool,
        &cfg,
        None,
        &LexicalReranker,
        "education funding",
        &principal("institution_7", Clearance::Student),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].chunk_index.is_none());
    assert!(results[0].score > 0.0);
    // No embedder means no lazy side effect.
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::NotEmbedded)
    );
}

#[tokio::test]
async fn empty_and_unmatched_queries_return_empty_not_error() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    for query in ["", "   ", "zzzqqqxyz unmatched"] {
        let results = search::run_query(
            &pool,
            &cfg,
            None,
            &LexicalReranker,
            query,
            &principal("institution_7", Clearance::Student),
        )
        .await
        .unwrap();
        assert!(results.is_empty(), "query {:?} should return empty", query);
    }
}

// ============ Scenario C: at-most-one embedding ============

#[tokio::test]
async fn scenario_c_concurrent_queries_embed_exactly_once() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let probe = Arc::new(ProbeProvider::counting());
    let provider: Arc<dyn EmbeddingProvider> = probe.clone();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let cfg = cfg.clone();
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await
        }));
    }

    for handle in handles {
        let outcomes = handle.await.unwrap();
        assert!(
            outcomes[0].1.is_available(),
            "every query must observe the document embedded, got {:?}",
            outcomes[0].1
        );
    }

    // Exactly one embedding computation across all concurrent queries.
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::Embedded)
    );
}

#[tokio::test]
async fn claim_timeout_skips_document_and_leaves_claim_running() {
    let (_dir, pool, mut cfg) = setup().await;
    cfg.retrieval.claim_wait_ms = 200;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let slow: Arc<dyn EmbeddingProvider> = Arc::new(ProbeProvider::slow(Duration::from_secs(2)));

    let winner = {
        let pool = pool.clone();
        let cfg = cfg.clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            lazy::ensure_embedded(&pool, &cfg, &slow, &["doc-a".to_string()]).await
        })
    };

    // Let the winner take the claim.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::InProgress)
    );

    // A second query gives up after its bounded wait and drops the document.
    let fast = hash_provider();
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &fast, &["doc-a".to_string()]).await;
    assert_eq!(outcomes[0].1, EmbedOutcome::SkippedBusy);

    // The winner still completes for the benefit of future queries.
    let outcomes = winner.await.unwrap();
    assert_eq!(outcomes[0].1, EmbedOutcome::Embedded);
}

#[tokio::test]
async fn cancelled_query_leaves_claimed_work_running_to_completion() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let slow: Arc<dyn EmbeddingProvider> =
        Arc::new(ProbeProvider::slow(Duration::from_millis(500)));

    let query_task = {
        let pool = pool.clone();
        let cfg = cfg.clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            lazy::ensure_embedded(&pool, &cfg, &slow, &["doc-a".to_string()]).await
        })
    };

    // Cancel the triggering query after its claim is in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    query_task.abort();

    // The detached embedding task still lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if lazy::embedding_status(&pool, "doc-a").await.unwrap()
            == Some(EmbeddingStatus::Embedded)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "embedding did not complete after query cancellation"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============ No partial chunk sets ============

#[tokio::test]
async fn failed_embedding_writes_no_chunks() {
    let (_dir, pool, mut cfg) = setup().await;
    // Force multiple provider batches so the failure lands mid-computation.
    cfg.embedding.batch_size = 1;
    let long_text = "Education reform paragraph with substantial content. ".repeat(40);
    ingest_and_extract(&pool, &cfg, "doc-a", &long_text, &public_triple("ministry_42")).await;

    let flaky: Arc<dyn EmbeddingProvider> = Arc::new(ProbeProvider::failing_after(1));
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &flaky, &["doc-a".to_string()]).await;
    assert_eq!(outcomes[0].1, EmbedOutcome::Failed);

    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::Failed)
    );
    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = 'doc-a'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(chunk_count, 0, "partial chunk writes are forbidden");

    // The failure is retryable: the next query that selects the document
    // claims it again and succeeds.
    let good = hash_provider();
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &good, &["doc-a".to_string()]).await;
    assert_eq!(outcomes[0].1, EmbedOutcome::Embedded);
    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = 'doc-a'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(chunk_count > 1);
}

#[tokio::test]
async fn cold_budget_bounds_embedding_work_per_query() {
    let (_dir, pool, mut cfg) = setup().await;
    cfg.retrieval.max_embed_per_query = 2;

    let ids: Vec<String> = (0..4).map(|i| format!("doc-{}", i)).collect();
    for id in &ids {
        let text = format!("Education policy volume {} with funding detail.", id);
        ingest_and_extract(&pool, &cfg, id, &text, &public_triple("ministry_42")).await;
    }

    let provider = hash_provider();
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &provider, &ids).await;
    let embedded = outcomes
        .iter()
        .filter(|(_, o)| *o == EmbedOutcome::Embedded)
        .count();
    let skipped = outcomes
        .iter()
        .filter(|(_, o)| *o == EmbedOutcome::SkippedBudget)
        .count();
    assert_eq!(embedded, 2);
    assert_eq!(skipped, 2);
}

// ============ Scenario D: access non-leakage ============

#[tokio::test]
async fn scenario_d_confidential_document_is_invisible_to_outsiders() {
    let (_dir, pool, cfg) = setup().await;
    let confidential = triple(Visibility::Confidential, "ministry_42", ApprovalState::Approved);
    ingest_and_extract(&pool, &cfg, "doc-secret", POLICY_TEXT, &confidential).await;

    // Embed it via an authorized query path so chunks exist.
    let provider = hash_provider();
    let authorized = search::run_query(
        &pool,
        &cfg,
        Some(&provider),
        &LexicalReranker,
        "education policy funding",
        &principal("ministry_42", Clearance::Ministry),
    )
    .await
    .unwrap();
    assert!(!authorized.is_empty());

    // A student elsewhere never sees it, however relevant the text.
    let outsider = search::run_query(
        &pool,
        &cfg,
        Some(&provider),
        &LexicalReranker,
        "education policy funding",
        &principal("institution_7", Clearance::Student),
    )
    .await
    .unwrap();
    assert!(outsider.is_empty());

    // The lexical filter never even shortlists it for that principal.
    let predicate = AccessPredicate::from_principal(&principal("institution_7", Clearance::Student));
    let candidates = lexical::lexical_candidates(&pool, &predicate, "education policy", 20)
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn unapproved_documents_never_surface() {
    let (_dir, pool, cfg) = setup().await;
    let pending = triple(Visibility::Public, "ministry_42", ApprovalState::Pending);
    ingest_and_extract(&pool, &cfg, "doc-p", POLICY_TEXT, &pending).await;

    let results = search::run_query(
        &pool,
        &cfg,
        None,
        &LexicalReranker,
        "education policy",
        &principal("ministry_42", Clearance::Ministry),
    )
    .await
    .unwrap();
    assert!(results.is_empty());
}

// ============ Staleness detection ============

#[tokio::test]
async fn triple_change_makes_chunks_stale_until_reembedded() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let provider = hash_provider();
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await;
    assert_eq!(outcomes[0].1, EmbedOutcome::Embedded);

    // The collaborator tightens access: public → confidential.
    let confidential = triple(Visibility::Confidential, "ministry_42", ApprovalState::Approved);
    ingest::update_access(&pool, "doc-a", &confidential)
        .await
        .unwrap();

    // Old chunks still carry the public triple, which an outsider's
    // predicate would accept; the staleness join must exclude them.
    let outsider = AccessPredicate::from_principal(&principal("institution_7", Clearance::Student));
    let query_vec = provider.embed(&[POLICY_TEXT.to_string()]).await.unwrap().remove(0);
    let hits = vector::similar_chunks(
        &pool,
        &outsider,
        &query_vec,
        DIMS,
        &["doc-a".to_string()],
        10,
    )
    .await
    .unwrap();
    assert!(hits.is_empty(), "stale chunks with the old triple leaked");

    // The next selection detects staleness and re-embeds under the new triple.
    let outcomes = lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await;
    assert_eq!(outcomes[0].1, EmbedOutcome::Embedded);

    let stale_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunks WHERE document_id = 'doc-a' AND visibility != 'confidential'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(stale_rows, 0);

    // Authorized staff in the owning institution now get chunk hits again.
    let staff = AccessPredicate::from_principal(&principal("ministry_42", Clearance::Staff));
    let hits = vector::similar_chunks(&pool, &staff, &query_vec, DIMS, &["doc-a".to_string()], 10)
        .await
        .unwrap();
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn content_change_resets_embedding_state_and_drops_chunks() {
    let (_dir, pool, cfg) = setup().await;
    let access = public_triple("ministry_42");
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &access).await;

    let provider = hash_provider();
    lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await;
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::Embedded)
    );

    let new_text = "Revised education policy with entirely new funding provisions for 2025.";
    ingest::upsert_document(
        &pool,
        "doc-a",
        new_text,
        &ingest::fingerprint(new_text),
        &access,
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::NotEmbedded)
    );
    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = 'doc-a'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(chunk_count, 0);

    // Metadata is queued for re-extraction and converges on the new text.
    let metadata = extract::extract_metadata(&pool, &cfg.extraction, None, "doc-a", None)
        .await
        .unwrap();
    assert_eq!(metadata.status, MetadataStatus::Ready);
    assert!(metadata.keywords.iter().any(|k| k == "2025"));
}

// ============ Explicit re-embed and deletion ============

#[tokio::test]
async fn explicit_reembed_request_resets_state() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;

    let provider = hash_provider();
    lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await;

    assert!(lazy::request_reembed(&pool, "doc-a").await.unwrap());
    assert_eq!(
        lazy::embedding_status(&pool, "doc-a").await.unwrap(),
        Some(EmbeddingStatus::NotEmbedded)
    );
}

#[tokio::test]
async fn deletion_cascades_to_metadata_and_chunks() {
    let (_dir, pool, cfg) = setup().await;
    ingest_and_extract(&pool, &cfg, "doc-a", POLICY_TEXT, &public_triple("ministry_42")).await;
    let provider = hash_provider();
    lazy::ensure_embedded(&pool, &cfg, &provider, &["doc-a".to_string()]).await;

    assert!(ingest::delete_document(&pool, "doc-a").await.unwrap());

    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    let metadata: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_metadata")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunks, 0);
    assert_eq!(metadata, 0);
    assert_eq!(lazy::embedding_status(&pool, "doc-a").await.unwrap(), None);
}
