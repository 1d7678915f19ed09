//! Unit of work: one persistence context for one logical operation.
//!
//! # Responsibility
//! - Bound the lifetime of a persistence context.
//! - Submit (Automatic) or discard (Manual) queued changes on disposal.
//! - Offer a contention-aware submit with bounded, randomized retries.
//!
//! # Invariants
//! - The context is released exactly once, even when the final submit fails.
//! - Dropping a unit without `dispose()` never submits; queued changes are
//!   discarded so error paths cannot flush half-built work.
//! - Every operation after disposal fails with `CrudError::AlreadyDisposed`.

use crate::cancel::CancellationToken;
use crate::db::{Database, InsertTicket, PersistenceContext, Table};
use crate::error::{CrudError, CrudResult};
use crate::lifecycle::Lifecycle;
use crate::mapping::Entity;
use crate::retry::RetryPolicy;
use log::{debug, warn};
use std::collections::HashMap;

/// What disposal does with queued changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryMode {
    /// Submit queued changes on disposal.
    #[default]
    Automatic,
    /// Discard queued changes on disposal unless submitted explicitly.
    Manual,
}

pub struct UnitOfWork {
    mode: EntryMode,
    context: Option<PersistenceContext>,
    generated_keys: HashMap<InsertTicket, i64>,
    lifecycle: Lifecycle,
}

impl UnitOfWork {
    /// Opens a unit over a fresh context from `database`.
    pub fn open(database: &Database, mode: EntryMode) -> CrudResult<Self> {
        Ok(Self::with_context(mode, database.open_context()?))
    }

    /// Wraps a context the caller already holds, e.g. to chain operations.
    pub fn with_context(mode: EntryMode, context: PersistenceContext) -> Self {
        Self {
            mode,
            context: Some(context),
            generated_keys: HashMap::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn mode(&self) -> EntryMode {
        self.mode
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    pub fn context(&mut self) -> CrudResult<&mut PersistenceContext> {
        self.lifecycle.ensure_not_disposed()?;
        self.context.as_mut().ok_or(CrudError::AlreadyDisposed)
    }

    pub fn table<T: Entity>(&mut self) -> CrudResult<Table<'_, T>> {
        self.context()?.table::<T>()
    }

    /// Flushes queued changes now, surfacing backend errors unchanged.
    pub fn submit(&mut self) -> CrudResult<()> {
        self.context()?.submit()
    }

    /// Submits, retrying only backend contention as described by `policy`.
    ///
    /// # Errors
    /// - `CrudError::RetryExhausted` when every attempt was contended.
    /// - Any non-contention error from the first attempt that raised it.
    pub fn deadlock_aware_submit(&mut self, policy: &RetryPolicy) -> CrudResult<()> {
        let context = self.context()?;
        policy.run(None, || context.submit())
    }

    /// Like [`UnitOfWork::deadlock_aware_submit`], but stops with
    /// `CrudError::Cancelled` when `cancel` fires before an attempt or during
    /// a retry delay.
    pub fn deadlock_aware_submit_with_cancel(
        &mut self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> CrudResult<()> {
        let context = self.context()?;
        policy.run(Some(cancel), || context.submit())
    }

    /// Store-assigned key of a submitted insert. Still available after
    /// disposal.
    pub fn generated_key(&self, ticket: InsertTicket) -> Option<i64> {
        match &self.context {
            Some(context) => context.generated_key(ticket),
            None => self.generated_keys.get(&ticket).copied(),
        }
    }

    /// Ends the unit: submits in Automatic mode, then releases the context.
    /// Repeated calls are no-ops.
    ///
    /// # Errors
    /// - The submit error in Automatic mode; the context is released anyway.
    pub fn dispose(&mut self) -> CrudResult<()> {
        let Self {
            mode,
            context,
            generated_keys,
            lifecycle,
        } = self;

        lifecycle
            .dispose_with(|| release(*mode, context, generated_keys, true))
            .unwrap_or(Ok(()))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let Self {
            mode,
            context,
            generated_keys,
            lifecycle,
        } = self;

        let _ = lifecycle.dispose_with(|| release(*mode, context, generated_keys, false));
    }
}

fn release(
    mode: EntryMode,
    context: &mut Option<PersistenceContext>,
    generated_keys: &mut HashMap<InsertTicket, i64>,
    submit: bool,
) -> CrudResult<()> {
    let Some(mut context) = context.take() else {
        return Ok(());
    };

    let result = if submit && mode == EntryMode::Automatic {
        context.submit()
    } else {
        let discarded = context.discard_pending();
        if discarded > 0 {
            if submit {
                debug!(
                    "event=unit_dispose module=unit_of_work status=discarded mode=manual changes={}",
                    discarded
                );
            } else {
                warn!(
                    "event=unit_dispose module=unit_of_work status=discarded mode={:?} changes={} reason=not_disposed",
                    mode, discarded
                );
            }
        }
        Ok(())
    };

    generated_keys.extend(context.take_generated_keys());
    drop(context);

    match &result {
        Ok(()) => debug!("event=unit_dispose module=unit_of_work status=ok mode={:?}", mode),
        Err(err) => warn!(
            "event=unit_dispose module=unit_of_work status=error mode={:?} error={}",
            mode, err
        ),
    }
    result
}
