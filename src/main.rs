//! # docgate CLI
//!
//! Drives the retrieval engine end to end. The `ingest` and `access`
//! commands stand in for the ingestion collaborator; `search` issues a
//! query as a role-bound principal.
//!
//! ```bash
//! docgate init --config ./docgate.toml
//! docgate ingest ./policy.txt --institution ministry_42 --visibility public --approval approved
//! docgate search "higher education funding" --institution institution_7 --clearance student
//! docgate status <document-id>
//! docgate embed <document-id>
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docgate::models::{AccessTriple, ApprovalState, Clearance, Principal, Visibility};
use docgate::{config, db, embedding, extract, ingest, lazy, migrate, rerank, search};

/// Access-controlled document retrieval with lazy, query-time embeddings.
#[derive(Parser)]
#[command(
    name = "docgate",
    about = "Access-controlled document retrieval with lazy, query-time embeddings",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a text file as a document (stands in for the ingestion
    /// collaborator), then run metadata extraction.
    Ingest {
        /// Path to a UTF-8 text file.
        path: PathBuf,

        /// Document id; defaults to a fingerprint-derived id.
        #[arg(long)]
        id: Option<String>,

        /// Owning institution of the document.
        #[arg(long)]
        institution: String,

        /// Visibility: public, internal, or confidential.
        #[arg(long, default_value = "public")]
        visibility: String,

        /// Approval state: draft, pending, or approved.
        #[arg(long, default_value = "approved")]
        approval: String,
    },

    /// Update a document's access triple (re-approval, visibility change).
    Access {
        id: String,
        #[arg(long)]
        institution: String,
        #[arg(long)]
        visibility: String,
        #[arg(long)]
        approval: String,
    },

    /// Re-run metadata extraction for a document.
    Extract { id: String },

    /// Search as a role-bound principal.
    Search {
        query: String,

        /// The principal's institution.
        #[arg(long)]
        institution: String,

        /// The principal's clearance: student, staff, or ministry.
        #[arg(long, default_value = "student")]
        clearance: String,
    },

    /// Show a document's embedding status.
    Status { id: String },

    /// Request re-embedding of a document on its next selection.
    Embed { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docgate=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            id,
            institution,
            visibility,
            approval,
        } => {
            let text = std::fs::read_to_string(&path)?;
            let fingerprint = ingest::fingerprint(&text);
            let id = id.unwrap_or_else(|| format!("doc-{}", &fingerprint[..12]));
            let access = AccessTriple {
                visibility: Visibility::parse(&visibility)?,
                owning_institution: institution,
                approval: ApprovalState::parse(&approval)?,
            };
            let filename = path.file_name().and_then(|n| n.to_str()).map(String::from);

            let pool = db::connect(&cfg).await?;
            ingest::upsert_document(&pool, &id, &text, &fingerprint, &access, filename.as_deref())
                .await?;

            let enricher = extract::create_enricher(&cfg.extraction)?;
            let metadata = extract::extract_metadata(
                &pool,
                &cfg.extraction,
                enricher.as_deref(),
                &id,
                filename.as_deref(),
            )
            .await?;

            println!("ingested {}", id);
            println!("  metadata: {}", metadata.status.as_str());
            if let Some(title) = &metadata.title {
                println!("  title: {}", title);
            }
            if !metadata.keywords.is_empty() {
                println!("  keywords: {}", metadata.keywords.join(", "));
            }
            pool.close().await;
        }
        Commands::Access {
            id,
            institution,
            visibility,
            approval,
        } => {
            let access = AccessTriple {
                visibility: Visibility::parse(&visibility)?,
                owning_institution: institution,
                approval: ApprovalState::parse(&approval)?,
            };
            let pool = db::connect(&cfg).await?;
            let updated = ingest::update_access(&pool, &id, &access).await?;
            println!("{}", if updated { "ok" } else { "not found" });
            pool.close().await;
        }
        Commands::Extract { id } => {
            let pool = db::connect(&cfg).await?;
            let enricher = extract::create_enricher(&cfg.extraction)?;
            let metadata =
                extract::extract_metadata(&pool, &cfg.extraction, enricher.as_deref(), &id, None)
                    .await?;
            println!("metadata: {}", metadata.status.as_str());
            println!("  keywords: {}", metadata.keywords.join(", "));
            pool.close().await;
        }
        Commands::Search {
            query,
            institution,
            clearance,
        } => {
            let principal = Principal {
                institution,
                clearance: Clearance::parse(&clearance)?,
            };
            let pool = db::connect(&cfg).await?;
            let embedder = embedding::create_provider(&cfg.embedding)?;
            let reranker = rerank::create_reranker(&cfg.rerank)?;

            let results = search::run_query(
                &pool,
                &cfg,
                embedder.as_ref(),
                reranker.as_ref(),
                &query,
                &principal,
            )
            .await?;

            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                let title = result.title.as_deref().unwrap_or("(untitled)");
                println!("{}. [{:.3}] {}", i + 1, result.score, title);
                println!("    document: {}", result.document_id);
                if let Some(index) = result.chunk_index {
                    println!("    chunk: {}", index);
                }
                println!(
                    "    excerpt: \"{}\"",
                    result.excerpt.replace('\n', " ").trim()
                );
                println!();
            }
            pool.close().await;
        }
        Commands::Status { id } => {
            let pool = db::connect(&cfg).await?;
            match lazy::embedding_status(&pool, &id).await? {
                Some(status) => println!("{}", status.as_str()),
                None => println!("not found"),
            }
            pool.close().await;
        }
        Commands::Embed { id } => {
            let pool = db::connect(&cfg).await?;
            let requested = lazy::request_reembed(&pool, &id).await?;
            println!(
                "{}",
                if requested {
                    "re-embed scheduled"
                } else {
                    "not eligible"
                }
            );
            pool.close().await;
        }
    }

    Ok(())
}
