//! Persistence context and its per-entity table view.
//!
//! # Responsibility
//! - Own (or borrow from the ambient transaction) one SQLite connection.
//! - Queue inserts, updates and deletes until `submit`.
//! - Run reads immediately against committed (or ambient) state.
//!
//! # Invariants
//! - A submit applies all queued changes or none of them.
//! - A failed submit keeps the queue intact so it can be retried.
//! - Queued changes are invisible to reads until submitted.
//! - Contexts are `!Send`: any context may share the thread-local ambient
//!   connection, so each thread opens its own.

use crate::error::{CrudError, CrudResult};
use crate::mapping::{resolve, Entity, EntityMetadata};
use crate::predicate::{quote_ident, Predicate};
use crate::transaction::AmbientTransaction;
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

const SUBMIT_SAVEPOINT: &str = "crudkit_submit";

/// Handle to a queued insert, used to look up the generated key after submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsertTicket(u64);

pub(crate) enum ContextConnection {
    Owned(Connection),
    Ambient(Rc<AmbientTransaction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Insert {
        ticket: InsertTicket,
        generated_key: bool,
    },
    Update,
    Delete,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChange {
    kind: ChangeKind,
    entity: &'static str,
    table: String,
    sql: String,
    params: Vec<Value>,
}

/// One session against the store: a connection plus queued changes.
pub struct PersistenceContext {
    connection: ContextConnection,
    pending: Vec<PendingChange>,
    next_ticket: u64,
    generated_keys: HashMap<InsertTicket, i64>,
}

impl PersistenceContext {
    pub(crate) fn new(connection: ContextConnection) -> Self {
        Self {
            connection,
            pending: Vec::new(),
            next_ticket: 0,
            generated_keys: HashMap::new(),
        }
    }

    /// Wraps a caller-managed connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self::new(ContextConnection::Owned(conn))
    }

    /// The connection reads and submits run on.
    pub fn connection(&self) -> &Connection {
        match &self.connection {
            ContextConnection::Owned(conn) => conn,
            ContextConnection::Ambient(ambient) => ambient.connection(),
        }
    }

    /// Whether this context runs inside an ambient `TransactionScope`.
    pub fn is_ambient(&self) -> bool {
        matches!(self.connection, ContextConnection::Ambient(_))
    }

    /// Typed view over the table of `T`.
    ///
    /// # Errors
    /// - `CrudError::Mapping` when `T` has an invalid mapping.
    pub fn table<T: Entity>(&mut self) -> CrudResult<Table<'_, T>> {
        let metadata = resolve::<T>()?;
        Ok(Table {
            context: self,
            metadata,
            _entity: PhantomData,
        })
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drops every queued change and returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Key the store assigned to a submitted insert.
    pub fn generated_key(&self, ticket: InsertTicket) -> Option<i64> {
        self.generated_keys.get(&ticket).copied()
    }

    pub(crate) fn take_generated_keys(&mut self) -> HashMap<InsertTicket, i64> {
        std::mem::take(&mut self.generated_keys)
    }

    /// Applies every queued change in one transaction.
    ///
    /// Owned connections use `BEGIN IMMEDIATE ... COMMIT`; ambient contexts
    /// use a savepoint inside the scope's transaction. An empty queue is a
    /// no-op and takes no locks.
    ///
    /// # Errors
    /// - Backend errors unchanged, including `SQLITE_BUSY` contention.
    /// - `CrudError::ChangeConflict` when a queued update/delete hit no row.
    /// - `CrudError::TransactionFinished` when the ambient scope has ended.
    pub fn submit(&mut self) -> CrudResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let started_at = Instant::now();
        let Self {
            connection,
            pending,
            generated_keys,
            ..
        } = self;

        let applied = match connection {
            ContextConnection::Owned(conn) => submit_owned(conn, pending),
            ContextConnection::Ambient(ambient) => submit_ambient(ambient, pending),
        };

        match applied {
            Ok(keys) => {
                debug!(
                    "event=context_submit module=db status=ok changes={} ambient={} duration_ms={}",
                    pending.len(),
                    matches!(connection, ContextConnection::Ambient(_)),
                    started_at.elapsed().as_millis()
                );
                generated_keys.extend(keys);
                pending.clear();
                Ok(())
            }
            Err(err) => {
                debug!(
                    "event=context_submit module=db status=error changes={} duration_ms={} error={}",
                    pending.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn enqueue(&mut self, change: PendingChange) {
        self.pending.push(change);
    }

    fn next_ticket(&mut self) -> InsertTicket {
        self.next_ticket += 1;
        InsertTicket(self.next_ticket)
    }
}

fn submit_owned(
    conn: &mut Connection,
    pending: &[PendingChange],
) -> CrudResult<Vec<(InsertTicket, i64)>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let keys = apply_changes(&tx, pending)?;
    tx.commit()?;
    Ok(keys)
}

fn submit_ambient(
    ambient: &AmbientTransaction,
    pending: &[PendingChange],
) -> CrudResult<Vec<(InsertTicket, i64)>> {
    if ambient.is_finished() {
        return Err(CrudError::TransactionFinished);
    }

    let conn = ambient.connection();
    conn.execute_batch(&format!("SAVEPOINT {SUBMIT_SAVEPOINT};"))?;
    match apply_changes(conn, pending) {
        Ok(keys) => {
            conn.execute_batch(&format!("RELEASE SAVEPOINT {SUBMIT_SAVEPOINT};"))?;
            Ok(keys)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {SUBMIT_SAVEPOINT}; RELEASE SAVEPOINT {SUBMIT_SAVEPOINT};"
            )) {
                log::error!(
                    "event=context_submit module=db status=error error_code=savepoint_rollback_failed error={}",
                    rollback_err
                );
            }
            Err(err)
        }
    }
}

fn apply_changes(
    conn: &Connection,
    pending: &[PendingChange],
) -> CrudResult<Vec<(InsertTicket, i64)>> {
    let mut keys = Vec::new();

    for change in pending {
        let mut stmt = conn.prepare_cached(&change.sql)?;
        let affected = stmt.execute(params_from_iter(change.params.iter()))?;

        match change.kind {
            ChangeKind::Insert {
                ticket,
                generated_key,
            } => {
                if generated_key {
                    keys.push((ticket, conn.last_insert_rowid()));
                }
            }
            ChangeKind::Update | ChangeKind::Delete => {
                if affected == 0 {
                    return Err(CrudError::ChangeConflict {
                        operation: change.kind.as_str(),
                        entity: change.entity,
                        table: change.table.clone(),
                    });
                }
            }
        }
    }

    Ok(keys)
}

/// Table of entity `T` inside one persistence context.
pub struct Table<'c, T> {
    context: &'c mut PersistenceContext,
    metadata: Arc<EntityMetadata>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Table<'_, T> {
    pub fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    /// Every row matching `predicate`.
    pub fn find(&self, predicate: &Predicate<T>) -> CrudResult<Vec<T>> {
        self.select(predicate, None)
    }

    /// The only row matching `predicate`, if any.
    ///
    /// # Errors
    /// - `CrudError::MultipleRows` when more than one row matches.
    pub fn single_or_none(&self, predicate: &Predicate<T>) -> CrudResult<Option<T>> {
        let mut rows = self.select(predicate, Some(2))?;
        if rows.len() > 1 {
            return Err(CrudError::MultipleRows {
                entity: self.metadata.entity(),
                table: self.metadata.table().to_string(),
            });
        }
        Ok(rows.pop())
    }

    pub fn count(&self, predicate: &Predicate<T>) -> CrudResult<usize> {
        let rendered = predicate.render()?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(self.metadata.table()),
            rendered.sql
        );
        let count: i64 = self.context.connection().query_row(
            &sql,
            params_from_iter(rendered.params.iter()),
            |row| row.get(0),
        )?;
        usize::try_from(count)
            .map_err(|_| CrudError::InvalidData(format!("negative row count {count}")))
    }

    /// Queues `entity` for insertion. A generated key is skipped in the
    /// statement and reported through the returned ticket after submit.
    pub fn insert_on_submit(&mut self, entity: &T) -> CrudResult<InsertTicket> {
        let values = self.checked_values(entity)?;
        let metadata = Arc::clone(&self.metadata);
        let key = metadata.key_column();
        let generated_key = key.is_generated();

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for (column, value) in metadata.columns().iter().zip(values) {
            if column.is_generated() {
                continue;
            }
            columns.push(quote_ident(column.name()));
            params.push(value);
        }

        let table = quote_ident(metadata.table());
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };

        let ticket = self.context.next_ticket();
        self.context.enqueue(PendingChange {
            kind: ChangeKind::Insert {
                ticket,
                generated_key,
            },
            entity: metadata.entity(),
            table: metadata.table().to_string(),
            sql,
            params,
        });
        Ok(ticket)
    }

    /// Queues an update writing every non-key column of `entity`.
    pub fn update_on_submit(&mut self, entity: &T) -> CrudResult<()> {
        let values = self.checked_values(entity)?;
        let metadata = Arc::clone(&self.metadata);
        let key_value = values[metadata.key_index()].clone();

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (index, (column, value)) in metadata.columns().iter().zip(values).enumerate() {
            if index == metadata.key_index() {
                continue;
            }
            assignments.push(format!("{} = ?", quote_ident(column.name())));
            params.push(value);
        }

        if assignments.is_empty() {
            return Ok(());
        }
        params.push(key_value);

        self.context.enqueue(PendingChange {
            kind: ChangeKind::Update,
            entity: metadata.entity(),
            table: metadata.table().to_string(),
            sql: format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote_ident(metadata.table()),
                assignments.join(", "),
                quote_ident(metadata.key_column().name())
            ),
            params,
        });
        Ok(())
    }

    /// Queues deletion of the row holding `entity`'s key.
    pub fn delete_on_submit(&mut self, entity: &T) -> CrudResult<()> {
        let values = self.checked_values(entity)?;
        let metadata = Arc::clone(&self.metadata);
        let key_value = values[metadata.key_index()].clone();

        self.context.enqueue(PendingChange {
            kind: ChangeKind::Delete,
            entity: metadata.entity(),
            table: metadata.table().to_string(),
            sql: format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(metadata.table()),
                quote_ident(metadata.key_column().name())
            ),
            params: vec![key_value],
        });
        Ok(())
    }

    /// Queues deletion of every entity in `entities`, returning how many.
    pub fn delete_all_on_submit<'e>(
        &mut self,
        entities: impl IntoIterator<Item = &'e T>,
    ) -> CrudResult<usize>
    where
        T: 'e,
    {
        let mut queued = 0;
        for entity in entities {
            self.delete_on_submit(entity)?;
            queued += 1;
        }
        Ok(queued)
    }

    fn select(&self, predicate: &Predicate<T>, limit: Option<usize>) -> CrudResult<Vec<T>> {
        let rendered = predicate.render()?;
        let columns = self
            .metadata
            .columns()
            .iter()
            .map(|column| quote_ident(column.name()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {columns} FROM {} WHERE {}",
            quote_ident(self.metadata.table()),
            rendered.sql
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.context.connection();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(rendered.params.iter()), |row| T::from_row(row))?;
        let entities = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    fn checked_values(&self, entity: &T) -> CrudResult<Vec<Value>> {
        let values = entity.to_values();
        let expected = self.metadata.columns().len();
        if values.len() != expected {
            return Err(CrudError::InvalidData(format!(
                "`{}` produced {} values for {} mapped columns",
                self.metadata.entity(),
                values.len(),
                expected
            )));
        }
        Ok(values)
    }
}
