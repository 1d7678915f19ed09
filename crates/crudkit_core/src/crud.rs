//! Generic CRUD facade.
//!
//! # Responsibility
//! - Provide get/create/modify/delete for any mapped entity type.
//! - Run every call inside its own unit of work.
//!
//! # Invariants
//! - Each mutating call commits in exactly one unit of work; calls only
//!   share a transaction when the caller wraps them in a `TransactionScope`.
//! - Absence is reported as `None`, `false` or `0`, never as an error.
//! - Mutations are explicit: entities are loaded, mutated, then queued as
//!   updates.

use crate::db::{Database, PersistenceContext};
use crate::error::{CrudError, CrudResult};
use crate::mapping::{resolve, Entity};
use crate::predicate::{id_predicate, read_id, Predicate};
use crate::unit_of_work::{EntryMode, UnitOfWork};
use log::debug;
use std::any::type_name;

/// CRUD entry points over one database.
#[derive(Debug, Clone)]
pub struct Crud {
    database: Database,
}

impl Crud {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Loads the entity whose primary key equals `id`.
    ///
    /// # Errors
    /// - `CrudError::MultipleRows` when the key is not unique in the store.
    pub fn get<T: Entity>(&self, id: i64) -> CrudResult<Option<T>> {
        let predicate = id_predicate::<T>(id)?;
        let mut unit = self.open_unit(EntryMode::Automatic)?;
        let entity = unit.table::<T>()?.single_or_none(&predicate)?;
        unit.dispose()?;

        debug!(
            "event=crud_get module=crud status=ok entity={} found={}",
            type_name::<T>(),
            entity.is_some()
        );
        Ok(entity)
    }

    /// Inserts a blank `T` populated by `initializer` and returns its key.
    ///
    /// A store-generated key is returned as assigned by the store; other
    /// integer keys are read back off the committed entity.
    ///
    /// # Errors
    /// - `CrudError::InvalidData` when the key is neither generated nor an
    ///   integer. The insert has already committed then.
    pub fn create<T, I>(&self, initializer: I) -> CrudResult<i64>
    where
        T: Entity + Default,
        I: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
    {
        let (entity, generated) = self.insert_new(initializer)?;
        match generated {
            Some(key) => Ok(key),
            None => read_id(&entity),
        }
    }

    /// Like [`Crud::create`], but returns `projector` applied to the
    /// committed entity. Covers non-integer and composite keys.
    pub fn create_with<T, I, P, R>(&self, initializer: I, projector: P) -> CrudResult<R>
    where
        T: Entity + Default,
        I: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
        P: FnOnce(&T) -> R,
    {
        let (entity, _) = self.insert_new(initializer)?;
        Ok(projector(&entity))
    }

    /// Deletes the entity with key `id`. Returns `false` when there is none.
    pub fn try_delete<T: Entity>(&self, id: i64) -> CrudResult<bool> {
        let predicate = id_predicate::<T>(id)?;
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        let existing = unit.table::<T>()?.single_or_none(&predicate)?;
        let found = match existing {
            Some(entity) => {
                unit.table::<T>()?.delete_on_submit(&entity)?;
                true
            }
            None => false,
        };
        unit.dispose()?;

        debug!(
            "event=crud_delete module=crud status=ok entity={} found={}",
            type_name::<T>(),
            found
        );
        Ok(found)
    }

    /// Deletes every entity matching `predicate` and returns how many.
    pub fn try_delete_where<T: Entity>(&self, predicate: &Predicate<T>) -> CrudResult<usize> {
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        let matches = unit.table::<T>()?.find(predicate)?;
        let count = unit.table::<T>()?.delete_all_on_submit(&matches)?;
        unit.dispose()?;

        debug!(
            "event=crud_delete module=crud status=ok entity={} count={}",
            type_name::<T>(),
            count
        );
        Ok(count)
    }

    /// Applies `mutator` to the entity with key `id` and saves it. Returns
    /// `false` when there is none.
    pub fn modify<T, M>(&self, id: i64, mutator: M) -> CrudResult<bool>
    where
        T: Entity,
        M: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
    {
        let predicate = id_predicate::<T>(id)?;
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        let existing = unit.table::<T>()?.single_or_none(&predicate)?;
        let found = match existing {
            Some(mut entity) => {
                mutator(unit.context()?, &mut entity)?;
                unit.table::<T>()?.update_on_submit(&entity)?;
                true
            }
            None => false,
        };
        unit.dispose()?;

        debug!(
            "event=crud_modify module=crud status=ok entity={} found={}",
            type_name::<T>(),
            found
        );
        Ok(found)
    }

    /// Applies `mutator` to every entity matching `predicate`, saves them and
    /// returns how many were changed.
    pub fn modify_where<T, M>(&self, predicate: &Predicate<T>, mut mutator: M) -> CrudResult<usize>
    where
        T: Entity,
        M: FnMut(&mut PersistenceContext, &mut T) -> CrudResult<()>,
    {
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        let matches = unit.table::<T>()?.find(predicate)?;
        let count = matches.len();
        for mut entity in matches {
            mutator(unit.context()?, &mut entity)?;
            unit.table::<T>()?.update_on_submit(&entity)?;
        }
        unit.dispose()?;

        debug!(
            "event=crud_modify module=crud status=ok entity={} count={}",
            type_name::<T>(),
            count
        );
        Ok(count)
    }

    /// Modifies the single entity matching `predicate`, or creates one with
    /// `create_actions` when nothing matches. Returns `true` when an insert
    /// happened.
    ///
    /// # Errors
    /// - `CrudError::MultipleRows` when more than one entity matches.
    pub fn create_or_modify<T, C, M>(
        &self,
        predicate: &Predicate<T>,
        create_actions: C,
        modifier: M,
    ) -> CrudResult<bool>
    where
        T: Entity + Default,
        C: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
        M: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
    {
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        let existing = unit.table::<T>()?.single_or_none(predicate)?;
        let created = match existing {
            Some(mut entity) => {
                modifier(unit.context()?, &mut entity)?;
                unit.table::<T>()?.update_on_submit(&entity)?;
                false
            }
            None => {
                let mut entity = T::default();
                create_actions(unit.context()?, &mut entity)?;
                unit.table::<T>()?.insert_on_submit(&entity)?;
                true
            }
        };
        unit.dispose()?;

        debug!(
            "event=crud_upsert module=crud status=ok entity={} created={}",
            type_name::<T>(),
            created
        );
        Ok(created)
    }

    /// Runs a read-only `selector` against a fresh context. Nothing the
    /// selector queues is submitted.
    pub fn pick<R>(
        &self,
        selector: impl FnOnce(&mut PersistenceContext) -> CrudResult<R>,
    ) -> CrudResult<R> {
        let mut unit = self.open_unit(EntryMode::Manual)?;
        let result = selector(unit.context()?)?;
        unit.dispose()?;
        Ok(result)
    }

    /// Every entity matching `predicate`.
    pub fn pick_all<T: Entity>(&self, predicate: &Predicate<T>) -> CrudResult<Vec<T>> {
        self.pick(|context| context.table::<T>()?.find(predicate))
    }

    /// Inserts and commits a fresh `T`, returning it with the generated key
    /// assigned, plus that key when the mapping declares one.
    fn insert_new<T, I>(&self, initializer: I) -> CrudResult<(T, Option<i64>)>
    where
        T: Entity + Default,
        I: FnOnce(&mut PersistenceContext, &mut T) -> CrudResult<()>,
    {
        let metadata = resolve::<T>()?;
        let mut entity = T::default();
        let mut unit = self.open_unit(EntryMode::Automatic)?;

        initializer(unit.context()?, &mut entity)?;
        let ticket = unit.table::<T>()?.insert_on_submit(&entity)?;
        unit.dispose()?;

        let generated = if metadata.key_column().is_generated() {
            let key = unit.generated_key(ticket).ok_or_else(|| {
                CrudError::InvalidData(format!(
                    "no generated key was reported for `{}`",
                    metadata.entity()
                ))
            })?;
            entity.assign_generated_key(key);
            Some(key)
        } else {
            None
        };

        debug!(
            "event=crud_create module=crud status=ok entity={}",
            type_name::<T>()
        );
        Ok((entity, generated))
    }

    fn open_unit(&self, mode: EntryMode) -> CrudResult<UnitOfWork> {
        UnitOfWork::open(&self.database, mode)
    }
}
