//! Entity mapping registration and primary-key resolution.
//!
//! # Responsibility
//! - Let applications describe how an entity maps onto a table.
//! - Validate that description once per type and cache the result.
//!
//! # Invariants
//! - A resolved entity has exactly one primary-key column.
//! - Resolution runs at most once per entity type per process, even under
//!   concurrent first use; every caller observes the same `Arc`.
//! - Invalid mappings are cached too, so the error is stable.

use crate::error::{CrudResult, MappingError};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Row;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A type stored as one row of one table.
///
/// `to_values` must return one value per mapped column, in the order the
/// columns were registered. `from_row` receives rows whose columns follow the
/// same order.
pub trait Entity: Sized + 'static {
    fn mapping() -> EntityMapping;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn to_values(&self) -> Vec<Value>;

    /// Receives the key the store assigned to a `generated` primary key after
    /// the insert is submitted. `Crud::create` reports that key either way;
    /// override this to see it on the entity passed to a projector.
    fn assign_generated_key(&mut self, _key: i64) {}
}

/// One mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    primary_key: bool,
    generated: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            generated: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// The store assigns this column on insert (`INTEGER PRIMARY KEY`).
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }
}

/// Fluent mapping description returned by `Entity::mapping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    table: String,
    columns: Vec<Column>,
}

impl EntityMapping {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Shorthand for a plain, non-key column.
    pub fn field(self, name: impl Into<String>) -> Self {
        self.column(Column::new(name))
    }
}

/// Validated mapping of one entity type.
#[derive(Debug, PartialEq, Eq)]
pub struct EntityMetadata {
    entity: &'static str,
    table: String,
    columns: Vec<Column>,
    key_index: usize,
}

impl EntityMetadata {
    fn from_mapping(entity: &'static str, mapping: EntityMapping) -> Result<Self, MappingError> {
        let EntityMapping { table, columns } = mapping;

        if table.trim().is_empty() {
            return Err(MappingError::EmptyTable { entity });
        }
        if columns.is_empty() {
            return Err(MappingError::NoColumns { entity });
        }

        for (index, column) in columns.iter().enumerate() {
            if columns[..index].iter().any(|seen| seen.name == column.name) {
                return Err(MappingError::DuplicateColumn {
                    entity,
                    column: column.name.clone(),
                });
            }
            if column.generated && !column.primary_key {
                return Err(MappingError::GeneratedNonKey {
                    entity,
                    column: column.name.clone(),
                });
            }
        }

        let keys: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary_key)
            .map(|(index, _)| index)
            .collect();

        let key_index = match keys.as_slice() {
            [single] => *single,
            [] => return Err(MappingError::MissingPrimaryKey { entity }),
            many => {
                return Err(MappingError::AmbiguousPrimaryKey {
                    entity,
                    columns: many.iter().map(|&i| columns[i].name.clone()).collect(),
                })
            }
        };

        Ok(Self {
            entity,
            table,
            columns,
            key_index,
        })
    }

    /// Rust type name of the entity, used in logs and errors.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn key_column(&self) -> &Column {
        &self.columns[self.key_index]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

type MetadataCell = OnceCell<Result<Arc<EntityMetadata>, MappingError>>;

static METADATA: Lazy<Mutex<HashMap<TypeId, Arc<MetadataCell>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolves and caches the validated mapping of `T`.
///
/// # Errors
/// - `MappingError::MissingPrimaryKey` / `AmbiguousPrimaryKey` when the
///   mapping does not flag exactly one primary-key column.
/// - Other `MappingError` variants for malformed mappings.
pub fn resolve<T: Entity>() -> CrudResult<Arc<EntityMetadata>> {
    let cell = {
        let mut cache = METADATA.lock();
        Arc::clone(cache.entry(TypeId::of::<T>()).or_default())
    };

    let resolved = cell.get_or_init(|| {
        let entity = type_name::<T>();
        let result = EntityMetadata::from_mapping(entity, T::mapping()).map(Arc::new);
        match &result {
            Ok(metadata) => log::debug!(
                "event=entity_resolve module=mapping status=ok entity={} table={} key={}",
                entity,
                metadata.table,
                metadata.key_column().name
            ),
            Err(err) => log::error!(
                "event=entity_resolve module=mapping status=error entity={} error={}",
                entity,
                err
            ),
        }
        result
    });

    resolved.clone().map_err(Into::into)
}

/// Returns the primary-key column of `T`.
pub fn primary_key<T: Entity>() -> CrudResult<Column> {
    Ok(resolve::<T>()?.key_column().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(mapping: EntityMapping) -> Result<EntityMetadata, MappingError> {
        EntityMetadata::from_mapping("Probe", mapping)
    }

    #[test]
    fn single_key_column_is_selected() {
        let resolved = metadata(
            EntityMapping::table("probes")
                .field("label")
                .column(Column::new("id").primary_key().generated()),
        )
        .unwrap();

        assert_eq!(resolved.key_index(), 1);
        assert_eq!(resolved.key_column().name(), "id");
        assert!(resolved.key_column().is_generated());
        assert_eq!(resolved.column_index("label"), Some(0));
        assert_eq!(resolved.column_index("missing"), None);
    }

    #[test]
    fn missing_key_is_rejected() {
        let err = metadata(EntityMapping::table("probes").field("label")).unwrap_err();
        assert_eq!(err, MappingError::MissingPrimaryKey { entity: "Probe" });
    }

    #[test]
    fn multiple_keys_are_rejected() {
        let err = metadata(
            EntityMapping::table("probes")
                .column(Column::new("a").primary_key())
                .column(Column::new("b").primary_key()),
        )
        .unwrap_err();
        assert!(matches!(err, MappingError::AmbiguousPrimaryKey { columns, .. } if columns == ["a", "b"]));
    }

    #[test]
    fn malformed_mappings_are_rejected() {
        assert!(matches!(
            metadata(EntityMapping::table(" ").column(Column::new("id").primary_key())),
            Err(MappingError::EmptyTable { .. })
        ));
        assert!(matches!(
            metadata(EntityMapping::table("probes")),
            Err(MappingError::NoColumns { .. })
        ));
        assert!(matches!(
            metadata(
                EntityMapping::table("probes")
                    .column(Column::new("id").primary_key())
                    .field("id")
            ),
            Err(MappingError::DuplicateColumn { .. })
        ));
        assert!(matches!(
            metadata(
                EntityMapping::table("probes")
                    .column(Column::new("id").primary_key())
                    .column(Column::new("seq").generated())
            ),
            Err(MappingError::GeneratedNonKey { .. })
        ));
    }
}
