//! Typed filters and the cached "match by primary key" template.
//!
//! # Responsibility
//! - Describe row filters as data instead of hand-written SQL.
//! - Build the per-type id predicate once and reuse it with a new literal.
//!
//! # Invariants
//! - Column names are checked against the entity mapping on render.
//! - Values are always bound as parameters, never spliced into SQL.
//! - The id template for a type is computed at most once per process.

use crate::error::{CrudError, CrudResult, MappingError};
use crate::mapping::{resolve, Entity, EntityMetadata};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rusqlite::types::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    All,
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    InList {
        column: String,
        values: Vec<Value>,
    },
    /// Clause rendered ahead of time by an `IdPredicateTemplate`.
    Prepared {
        clause: Arc<str>,
        value: Value,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

/// A boolean filter over rows of entity `T`.
pub struct Predicate<T> {
    filter: Filter,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self::from_filter(self.filter.clone())
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.filter).finish()
    }
}

impl<T> Predicate<T> {
    fn from_filter(filter: Filter) -> Self {
        Self {
            filter,
            _entity: PhantomData,
        }
    }

    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::from_filter(Filter::Compare {
            column: column.into(),
            op,
            value: value.into(),
        })
    }

    /// Matches every row.
    pub fn all() -> Self {
        Self::from_filter(Filter::All)
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    /// SQL `LIKE` with `%`/`_` wildcards.
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(column, CompareOp::Like, pattern.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::from_filter(Filter::IsNull {
            column: column.into(),
            negated: false,
        })
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::from_filter(Filter::IsNull {
            column: column.into(),
            negated: true,
        })
    }

    /// Matches rows whose column equals any of `values`. An empty list
    /// matches nothing.
    pub fn in_list<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::from_filter(Filter::InList {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn and(self, other: Predicate<T>) -> Self {
        Self::from_filter(Filter::And(Box::new(self.filter), Box::new(other.filter)))
    }

    pub fn or(self, other: Predicate<T>) -> Self {
        Self::from_filter(Filter::Or(Box::new(self.filter), Box::new(other.filter)))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::from_filter(Filter::Not(Box::new(self.filter)))
    }
}

/// SQL `WHERE` body with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPredicate {
    pub sql: String,
    pub params: Vec<Value>,
}

impl<T: Entity> Predicate<T> {
    /// Renders this predicate against the mapping of `T`.
    pub fn render(&self) -> CrudResult<RenderedPredicate> {
        let metadata = resolve::<T>()?;
        let mut rendered = RenderedPredicate {
            sql: String::new(),
            params: Vec::new(),
        };
        render_filter(&self.filter, &metadata, &mut rendered)?;
        Ok(rendered)
    }
}

fn render_filter(
    filter: &Filter,
    metadata: &EntityMetadata,
    out: &mut RenderedPredicate,
) -> CrudResult<()> {
    match filter {
        Filter::All => out.sql.push_str("1 = 1"),
        Filter::Compare { column, op, value } => {
            push_column(column, metadata, out)?;
            out.sql.push(' ');
            out.sql.push_str(op.as_sql());
            out.sql.push_str(" ?");
            out.params.push(value.clone());
        }
        Filter::IsNull { column, negated } => {
            push_column(column, metadata, out)?;
            out.sql
                .push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
        }
        Filter::InList { column, values } => {
            if values.is_empty() {
                checked_column(column, metadata)?;
                out.sql.push_str("1 = 0");
            } else {
                push_column(column, metadata, out)?;
                out.sql.push_str(" IN (");
                out.sql.push_str(&vec!["?"; values.len()].join(", "));
                out.sql.push(')');
                out.params.extend(values.iter().cloned());
            }
        }
        Filter::Prepared { clause, value } => {
            out.sql.push_str(clause);
            out.params.push(value.clone());
        }
        Filter::And(left, right) => render_binary(left, "AND", right, metadata, out)?,
        Filter::Or(left, right) => render_binary(left, "OR", right, metadata, out)?,
        Filter::Not(inner) => {
            out.sql.push_str("NOT (");
            render_filter(inner, metadata, out)?;
            out.sql.push(')');
        }
    }
    Ok(())
}

fn render_binary(
    left: &Filter,
    op: &str,
    right: &Filter,
    metadata: &EntityMetadata,
    out: &mut RenderedPredicate,
) -> CrudResult<()> {
    out.sql.push('(');
    render_filter(left, metadata, out)?;
    out.sql.push_str(") ");
    out.sql.push_str(op);
    out.sql.push_str(" (");
    render_filter(right, metadata, out)?;
    out.sql.push(')');
    Ok(())
}

fn checked_column<'a>(column: &'a str, metadata: &EntityMetadata) -> CrudResult<&'a str> {
    if metadata.column_index(column).is_none() {
        return Err(MappingError::UnknownColumn {
            entity: metadata.entity(),
            column: column.to_string(),
        }
        .into());
    }
    Ok(column)
}

fn push_column(column: &str, metadata: &EntityMetadata, out: &mut RenderedPredicate) -> CrudResult<()> {
    let column = checked_column(column, metadata)?;
    out.sql.push_str(&quote_ident(column));
    Ok(())
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Cached "key == ?" clause plus the key position used to read ids back.
#[derive(Debug, PartialEq, Eq)]
pub struct IdPredicateTemplate {
    clause: Arc<str>,
    key_index: usize,
}

impl IdPredicateTemplate {
    fn build(metadata: &EntityMetadata) -> Self {
        Self {
            clause: Arc::from(format!("{} = ?", quote_ident(metadata.key_column().name()))),
            key_index: metadata.key_index(),
        }
    }

    pub fn clause(&self) -> &str {
        &self.clause
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }
}

static ID_TEMPLATES: Lazy<Mutex<HashMap<TypeId, Arc<OnceCell<Arc<IdPredicateTemplate>>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the cached id template of `T`, building it on first use.
pub fn id_template<T: Entity>() -> CrudResult<Arc<IdPredicateTemplate>> {
    let cell = {
        let mut cache = ID_TEMPLATES.lock();
        Arc::clone(cache.entry(TypeId::of::<T>()).or_default())
    };

    let template = cell.get_or_try_init(|| -> CrudResult<_> {
        let metadata = resolve::<T>()?;
        Ok(Arc::new(IdPredicateTemplate::build(&metadata)))
    })?;
    Ok(Arc::clone(template))
}

/// Builds `key == id` for `T` from the cached template.
pub fn id_predicate<T: Entity>(id: i64) -> CrudResult<Predicate<T>> {
    let template = id_template::<T>()?;
    Ok(Predicate::from_filter(Filter::Prepared {
        clause: Arc::clone(&template.clause),
        value: Value::Integer(id),
    }))
}

/// Reads the primary-key value off `entity`.
pub fn read_key<T: Entity>(entity: &T) -> CrudResult<Value> {
    let template = id_template::<T>()?;
    let mut values = entity.to_values();
    if template.key_index >= values.len() {
        return Err(CrudError::InvalidData(format!(
            "`{}` produced {} values but its key is column {}",
            std::any::type_name::<T>(),
            values.len(),
            template.key_index
        )));
    }
    Ok(values.swap_remove(template.key_index))
}

/// Reads an integer primary key off `entity`, typically right after insert.
pub fn read_id<T: Entity>(entity: &T) -> CrudResult<i64> {
    match read_key(entity)? {
        Value::Integer(id) => Ok(id),
        other => Err(CrudError::InvalidData(format!(
            "`{}` key is {:?}, not an integer",
            std::any::type_name::<T>(),
            other.data_type()
        ))),
    }
}
