//! Persistence-context factory.
//!
//! # Responsibility
//! - Hold validated connection settings for one SQLite database file.
//! - Hand out a fresh persistence context per logical operation.
//!
//! # Invariants
//! - Contexts are never pooled or reused across operations.
//! - A context opened while this thread has an active `TransactionScope`
//!   for the same file joins that scope instead of opening a connection.

mod context;
mod open;

pub use context::{InsertTicket, PersistenceContext, Table};

use crate::config::DatabaseConfig;
use crate::error::CrudResult;
use crate::transaction::current_ambient;
use context::ContextConnection;
use log::info;
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;

/// Cheap-to-clone handle describing where persistence contexts connect.
#[derive(Debug, Clone)]
pub struct Database {
    config: Arc<DatabaseConfig>,
    scope_key: Arc<OnceCell<PathBuf>>,
}

impl Database {
    /// Validates `config` without touching the file system.
    pub fn new(config: DatabaseConfig) -> CrudResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            scope_key: Arc::new(OnceCell::new()),
        })
    }

    /// Validates `config` and proves the database can be opened.
    pub fn open(config: DatabaseConfig) -> CrudResult<Self> {
        let database = Self::new(config)?;
        drop(database.connect()?);
        info!(
            "event=database_ready module=db status=ok busy_timeout_ms={} foreign_keys={}",
            database.config.busy_timeout_ms, database.config.foreign_keys
        );
        Ok(database)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Opens an independent, configured connection that never joins an
    /// ambient scope.
    pub fn connect(&self) -> CrudResult<Connection> {
        open::open_connection(&self.config)
    }

    /// Opens a fresh persistence context, joining this thread's ambient
    /// transaction for the same database when one is active.
    pub fn open_context(&self) -> CrudResult<PersistenceContext> {
        if let Some(ambient) = current_ambient(&self.scope_key()) {
            return Ok(PersistenceContext::new(ContextConnection::Ambient(ambient)));
        }
        let conn = self.connect()?;
        Ok(PersistenceContext::new(ContextConnection::Owned(conn)))
    }

    /// Canonical path used to match ambient scopes. The configured path is
    /// used as-is until the file exists.
    pub(crate) fn scope_key(&self) -> PathBuf {
        if let Some(key) = self.scope_key.get() {
            return key.clone();
        }
        match std::fs::canonicalize(&self.config.path) {
            Ok(canonical) => self.scope_key.get_or_init(|| canonical).clone(),
            Err(_) => self.config.path.clone(),
        }
    }
}
