//! Per-query access predicate.
//!
//! Built from the requesting [`Principal`](crate::models::Principal) and
//! applied in two places that must never disagree: as a SQL fragment pushed
//! into the lexical and vector store queries (filter-then-rank), and as a
//! Rust-side check over a chunk's denormalized triple.
//!
//! Rules: only `approved` documents are searchable. `public` is visible to
//! everyone; `internal` to members of the owning institution and to
//! `ministry` clearance anywhere; `confidential` to `ministry` clearance
//! anywhere and to owning-institution members with clearance >= `staff`.

use crate::models::{AccessTriple, ApprovalState, Clearance, Principal, Visibility};

/// Not persisted; constructed fresh for every query.
#[derive(Debug, Clone)]
pub struct AccessPredicate {
    institution: String,
    clearance_rank: i64,
}

impl AccessPredicate {
    pub fn from_principal(principal: &Principal) -> Self {
        Self {
            institution: principal.institution.clone(),
            clearance_rank: principal.clearance.rank(),
        }
    }

    /// SQL condition over a row's access-triple columns. `col_prefix` is the
    /// table alias of the row carrying the triple (e.g. `"d."` or `"c."`).
    ///
    /// The fragment contains exactly three `?` placeholders; bind them with
    /// [`AccessPredicate::bind`] in the same order.
    pub fn sql_clause(&self, col_prefix: &str) -> String {
        format!(
            "({p}approval_state = 'approved' AND ({p}visibility = 'public' \
             OR ? >= 3 \
             OR ({p}owning_institution = ? AND ({p}visibility = 'internal' OR ? >= 2))))",
            p = col_prefix
        )
    }

    /// Bind the three placeholder values of [`AccessPredicate::sql_clause`].
    pub fn bind<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(self.clearance_rank)
            .bind(&self.institution)
            .bind(self.clearance_rank)
    }

    /// Rust-side evaluation of the same rules, used to cross-check the
    /// denormalized triple on returned chunks.
    pub fn allows(&self, triple: &AccessTriple) -> bool {
        if triple.approval != ApprovalState::Approved {
            return false;
        }
        match triple.visibility {
            Visibility::Public => true,
            Visibility::Internal => {
                self.clearance_rank >= Clearance::Ministry.rank()
                    || triple.owning_institution == self.institution
            }
            Visibility::Confidential => {
                self.clearance_rank >= Clearance::Ministry.rank()
                    || (triple.owning_institution == self.institution
                        && self.clearance_rank >= Clearance::Staff.rank())
            }
        }
    }
}
