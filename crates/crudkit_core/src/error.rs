//! Error taxonomy for the data-access layer.
//!
//! # Responsibility
//! - Separate configuration errors from backend failures.
//! - Classify backend contention so retry loops can stay narrow.
//!
//! # Invariants
//! - Not-found is never an error; callers receive `None`, `false` or `0`.
//! - Backend errors are carried unchanged in `CrudError::Sqlite`.

use thiserror::Error;

pub type CrudResult<T> = Result<T, CrudError>;

/// Entity mapping problems detected when an entity type is first resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("entity `{entity}` has no table name")]
    EmptyTable { entity: &'static str },
    #[error("entity `{entity}` declares no columns")]
    NoColumns { entity: &'static str },
    #[error("entity `{entity}` declares column `{column}` more than once")]
    DuplicateColumn {
        entity: &'static str,
        column: String,
    },
    #[error("entity `{entity}` has no primary key column")]
    MissingPrimaryKey { entity: &'static str },
    #[error("entity `{entity}` has ambiguous primary key columns: {}", .columns.join(", "))]
    AmbiguousPrimaryKey {
        entity: &'static str,
        columns: Vec<String>,
    },
    #[error("entity `{entity}` marks non-key column `{column}` as generated")]
    GeneratedNonKey {
        entity: &'static str,
        column: String,
    },
    #[error("entity `{entity}` has no column named `{column}`")]
    UnknownColumn {
        entity: &'static str,
        column: String,
    },
}

/// Error type shared by every public operation of this crate.
#[derive(Debug, Error)]
pub enum CrudError {
    #[error("entity mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("more than one `{entity}` row in `{table}` matched a single-row lookup")]
    MultipleRows {
        entity: &'static str,
        table: String,
    },
    #[error("queued {operation} of `{entity}` in `{table}` matched no row")]
    ChangeConflict {
        operation: &'static str,
        entity: &'static str,
        table: String,
    },
    #[error("submit gave up after {attempts} contended attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("object already disposed")]
    AlreadyDisposed,
    #[error("ambient transaction already finished")]
    TransactionFinished,
    #[error("transaction scope voted to commit but the transaction was rolled back")]
    TransactionAborted,
    #[error("invalid entity data: {0}")]
    InvalidData(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CrudError {
    /// Returns whether this error is backend contention whose primary SQLite
    /// result code is listed in `codes`.
    pub fn is_contention(&self, codes: &[i32]) -> bool {
        match self {
            Self::Sqlite(err) => is_contention_error(err, codes),
            _ => false,
        }
    }
}

/// Returns whether `err` carries one of the given primary result codes.
///
/// Extended codes are masked down to their primary code, so
/// `SQLITE_BUSY_SNAPSHOT` still counts as `SQLITE_BUSY`.
pub fn is_contention_error(err: &rusqlite::Error, codes: &[i32]) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            let primary = failure.extended_code & 0xff;
            codes.contains(&primary)
        }
        _ => false,
    }
}
