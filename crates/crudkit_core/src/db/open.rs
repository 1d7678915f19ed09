//! Connection bootstrap for SQLite.
//!
//! # Responsibility
//! - Open one connection per persistence context.
//! - Apply the pragmas every context relies on.
//!
//! # Invariants
//! - Returned connections honor the configured busy timeout.
//! - Returned connections have `foreign_keys` set as configured.

use crate::config::DatabaseConfig;
use crate::error::CrudResult;
use log::{debug, error};
use rusqlite::Connection;
use std::time::Instant;

/// Opens and configures a connection to the configured database file.
///
/// # Side effects
/// - Creates the database file when it does not exist yet.
/// - Emits `db_open` logging events with duration and status.
pub(crate) fn open_connection(config: &DatabaseConfig) -> CrudResult<Connection> {
    let started_at = Instant::now();

    let conn = match Connection::open(&config.path) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&conn, config) {
        Ok(()) => {
            debug!(
                "event=db_open module=db status=ok duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err.into())
        }
    }
}

fn bootstrap_connection(conn: &Connection, config: &DatabaseConfig) -> rusqlite::Result<()> {
    let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
    conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}
