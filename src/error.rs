//! Error taxonomy shared by the stores and the migration engine.
//!
//! Local irregularities (one malformed article body, one image without a usable
//! source) never surface here; they are absorbed and counted by the orchestrator.
//! Everything below is structural and propagates.
use thiserror::Error;

/// Failures reported by the source or target store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot reach {store} store: {message}")]
    Connectivity {
        store: &'static str,
        message: String,
    },
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },
    #[error("foreign key violated on {table}: {detail}")]
    ForeignKeyViolation { table: String, detail: String },
    #[error("cannot decode {table}.{column}: {detail}")]
    Decode {
        table: String,
        column: String,
        detail: String,
    },
    #[error("database error on {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Classifies a driver error raised while writing `table`.
    pub fn from_sqlx(table: &str, err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            let detail = db_err
                .constraint()
                .map(|c| format!("{} ({c})", db_err.message()))
                .unwrap_or_else(|| db_err.message().to_string());
            if db_err.is_unique_violation() {
                return StoreError::UniqueViolation {
                    table: table.to_string(),
                    detail,
                };
            }
            if db_err.is_foreign_key_violation() {
                return StoreError::ForeignKeyViolation {
                    table: table.to_string(),
                    detail,
                };
            }
        }
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => StoreError::Connectivity {
                store: "database",
                message: err.to_string(),
            },
            other => StoreError::Database {
                table: table.to_string(),
                source: other,
            },
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, StoreError::ForeignKeyViolation { .. })
    }
}

/// Structural problems in a source tree. All of them are caller precondition
/// failures: the batch is rejected before anything reaches the target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node id {id} is not positive")]
    NonPositiveId { id: i64 },
    #[error("node {id} has left bound {left} >= right bound {right}")]
    InvertedBounds { id: i64, left: i64, right: i64 },
    #[error("node {id} bounds are not nested inside parent {parent_id}")]
    Uncontained { id: i64, parent_id: i64 },
    #[error("node {id} points at parent {parent_id}, which is not part of the tree")]
    DanglingParent { id: i64, parent_id: i64 },
    #[error("id {id} appears twice after shifting by {offset}")]
    DuplicateId { id: i64, offset: i64 },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("bulk insert into {table} still violates uniqueness after de-duplication: {source}")]
    Unresolved {
        table: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("duplicate lookup for {table} failed: {source}")]
    Lookup {
        table: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("{kind} chunk {chunk} ({rows} rows) rejected: {source}")]
pub struct LinkError {
    pub kind: &'static str,
    pub chunk: usize,
    pub rows: usize,
    #[source]
    pub source: StoreError,
}

/// A linking or fixup step was started before a phase it reads from committed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{step} cannot run before {missing} has committed")]
pub struct PhaseOrderError {
    pub step: &'static str,
    pub missing: &'static str,
}

/// Recoverable per-item failure while scanning rich text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("unterminated <img> tag at byte {offset}")]
    UnterminatedTag { offset: usize },
    #[error("unbalanced attribute quotes in <img> tag at byte {offset}")]
    UnbalancedQuotes { offset: usize },
}

/// Boundary validation failures, raised before any connection is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--offset requires --limit")]
    OffsetWithoutLimit,
    #[error("{0} must be greater than zero")]
    ZeroSize(&'static str),
    #[error("missing required setting {0}")]
    Missing(&'static str),
}
