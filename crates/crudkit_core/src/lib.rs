//! Generic data-access helpers over SQLite.
//!
//! Provides a CRUD facade keyed by primary key, scoped units of work with
//! commit-or-discard disposal, contention-aware submit retries and ambient
//! serializable transaction scopes.

pub mod cancel;
pub mod config;
pub mod crud;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod mapping;
pub mod predicate;
pub mod retry;
pub mod transaction;
pub mod unit_of_work;

pub use cancel::CancellationToken;
pub use config::{CoreConfig, DatabaseConfig, LoggingConfig};
pub use crud::Crud;
pub use db::{Database, InsertTicket, PersistenceContext, Table};
pub use error::{CrudError, CrudResult, MappingError};
pub use lifecycle::Lifecycle;
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use mapping::{primary_key, resolve, Column, Entity, EntityMapping, EntityMetadata};
pub use predicate::{id_predicate, read_id, read_key, IdPredicateTemplate, Predicate};
pub use retry::RetryPolicy;
pub use transaction::{has_ambient_transaction, IsolationLevel, TransactionScope};
pub use unit_of_work::{EntryMode, UnitOfWork};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
