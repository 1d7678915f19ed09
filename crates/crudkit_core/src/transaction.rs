//! Ambient serializable transaction scopes.
//!
//! # Responsibility
//! - Open one backend transaction that units of work join implicitly.
//! - Commit only when every participating scope voted to commit.
//!
//! # Invariants
//! - Scopes are thread-local: contexts opened on the same thread against the
//!   same database file reuse the innermost active scope's connection.
//! - Files are matched by canonical path, so differently spelled handles to
//!   one file share a scope.
//! - A nested scope disposed without `commit()` dooms the whole transaction.
//! - The root scope ends the backend transaction exactly once.

use crate::db::Database;
use crate::error::{CrudError, CrudResult};
use crate::lifecycle::Lifecycle;
use log::{error, info, warn};
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;

/// Isolation level of every `TransactionScope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// SQLite's only write isolation: transactions behave as if run one at
    /// a time. Scopes start with `BEGIN IMMEDIATE` to take the write lock
    /// up front.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serializable => f.write_str("serializable"),
        }
    }
}

/// Backend transaction shared by a root scope and everything that joins it.
pub(crate) struct AmbientTransaction {
    id: Uuid,
    database: PathBuf,
    conn: Connection,
    doomed: Cell<bool>,
    finished: Cell<bool>,
}

impl AmbientTransaction {
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

thread_local! {
    static AMBIENT: RefCell<Vec<Rc<AmbientTransaction>>> = const { RefCell::new(Vec::new()) };
}

/// Innermost live ambient transaction on this thread for `database`.
pub(crate) fn current_ambient(database: &Path) -> Option<Rc<AmbientTransaction>> {
    AMBIENT.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|ambient| ambient.database == database && !ambient.is_finished())
            .cloned()
    })
}

/// Whether this thread has an active scope for `database`.
pub fn has_ambient_transaction(database: &Database) -> bool {
    current_ambient(&database.scope_key()).is_some()
}

/// Serializable transaction boundary joined by units of work on this thread.
///
/// Call [`TransactionScope::commit`] to vote for persisting the enclosed
/// work, then dispose (explicitly or by dropping). Without a commit vote all
/// enclosed work is rolled back.
pub struct TransactionScope {
    ambient: Rc<AmbientTransaction>,
    root: bool,
    committed: Cell<bool>,
    lifecycle: Lifecycle,
}

impl TransactionScope {
    pub const ISOLATION_LEVEL: IsolationLevel = IsolationLevel::Serializable;

    /// Begins a scope, joining the active scope for the same database if
    /// there is one on this thread.
    ///
    /// # Errors
    /// - Backend errors from opening the connection or `BEGIN IMMEDIATE`
    ///   (including `SQLITE_BUSY` when another writer holds the lock).
    pub fn begin(database: &Database) -> CrudResult<Self> {
        let (ambient, root) = match current_ambient(&database.scope_key()) {
            Some(ambient) => (ambient, false),
            None => {
                let conn = database.connect()?;
                conn.execute_batch("BEGIN IMMEDIATE;")?;
                let ambient = Rc::new(AmbientTransaction {
                    id: Uuid::new_v4(),
                    // Re-read: the file exists now that a connection opened it.
                    database: database.scope_key(),
                    conn,
                    doomed: Cell::new(false),
                    finished: Cell::new(false),
                });
                (ambient, true)
            }
        };

        AMBIENT.with(|stack| stack.borrow_mut().push(Rc::clone(&ambient)));
        info!(
            "event=scope_begin module=transaction status=ok scope_id={} root={} isolation={}",
            ambient.id,
            root,
            Self::ISOLATION_LEVEL
        );

        Ok(Self {
            ambient,
            root,
            committed: Cell::new(false),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Runs `body` inside a new scope, committing when it returns `Ok`.
    pub fn run<R>(
        database: &Database,
        body: impl FnOnce(&TransactionScope) -> CrudResult<R>,
    ) -> CrudResult<R> {
        let scope = Self::begin(database)?;
        let result = body(&scope);
        if result.is_ok() {
            scope.commit()?;
        }
        let disposed = scope.dispose();
        let value = result?;
        disposed?;
        Ok(value)
    }

    /// Votes to persist the enclosed work when this scope is disposed.
    pub fn commit(&self) -> CrudResult<()> {
        self.lifecycle.ensure_not_disposed()?;
        self.committed.set(true);
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn is_committed(&self) -> bool {
        self.committed.get()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        Self::ISOLATION_LEVEL
    }

    /// Leaves the scope. The root scope commits or rolls back the backend
    /// transaction; nested scopes only record their vote. Repeated calls are
    /// no-ops.
    ///
    /// # Errors
    /// - `CrudError::TransactionAborted` when this root scope voted to commit
    ///   but a participant did not, so the work was rolled back.
    /// - Backend errors from `COMMIT`; the transaction is rolled back then.
    pub fn dispose(&self) -> CrudResult<()> {
        self.lifecycle
            .dispose_with(|| self.finish())
            .unwrap_or(Ok(()))
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    fn finish(&self) -> CrudResult<()> {
        AMBIENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack
                .iter()
                .rposition(|ambient| Rc::ptr_eq(ambient, &self.ambient))
            {
                stack.remove(position);
            }
        });

        let ambient = &self.ambient;
        if !self.committed.get() {
            ambient.doomed.set(true);
        }

        if !self.root {
            return Ok(());
        }

        ambient.finished.set(true);
        if ambient.doomed.get() {
            if !ambient.conn.is_autocommit() {
                ambient.conn.execute_batch("ROLLBACK;")?;
            }
            if self.committed.get() {
                warn!(
                    "event=scope_end module=transaction status=aborted scope_id={} reason=participant_without_commit",
                    ambient.id
                );
                return Err(CrudError::TransactionAborted);
            }
            info!(
                "event=scope_end module=transaction status=rolled_back scope_id={}",
                ambient.id
            );
            return Ok(());
        }

        match ambient.conn.execute_batch("COMMIT;") {
            Ok(()) => {
                info!(
                    "event=scope_end module=transaction status=committed scope_id={}",
                    ambient.id
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=scope_end module=transaction status=error scope_id={} error={}",
                    ambient.id, err
                );
                if !ambient.conn.is_autocommit() {
                    if let Err(rollback_err) = ambient.conn.execute_batch("ROLLBACK;") {
                        error!(
                            "event=scope_end module=transaction status=error scope_id={} error_code=rollback_failed error={}",
                            ambient.id, rollback_err
                        );
                    }
                }
                Err(CrudError::Sqlite(err))
            }
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            error!(
                "event=scope_drop module=transaction status=error scope_id={} error={}",
                self.ambient.id, err
            );
        }
    }
}
