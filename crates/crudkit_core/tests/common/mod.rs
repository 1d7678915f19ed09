#![allow(dead_code)]

use crudkit_core::{Column, Crud, Database, DatabaseConfig, Entity, EntityMapping};
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::path::PathBuf;
use tempfile::TempDir;

const SCHEMA: &str = "
CREATE TABLE customers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    tier TEXT NOT NULL,
    credit INTEGER NOT NULL
);
CREATE TABLE settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE notes (
    id INTEGER PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE loose_rows (
    id INTEGER NOT NULL,
    label TEXT NOT NULL
);
";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub tier: String,
    pub credit: i64,
}

impl Entity for Customer {
    fn mapping() -> EntityMapping {
        EntityMapping::table("customers")
            .column(Column::new("id").primary_key().generated())
            .field("name")
            .field("email")
            .field("tier")
            .field("credit")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            tier: row.get(3)?,
            credit: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Text(self.name.clone()),
            Value::Text(self.email.clone()),
            Value::Text(self.tier.clone()),
            Value::Integer(self.credit),
        ]
    }

    fn assign_generated_key(&mut self, key: i64) {
        self.id = key;
    }
}

/// Entity with a caller-chosen text key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

impl Entity for Setting {
    fn mapping() -> EntityMapping {
        EntityMapping::table("settings")
            .column(Column::new("key").primary_key())
            .field("value")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Text(self.key.clone()), Value::Text(self.value.clone())]
    }
}

/// Mapped with a key the table does not enforce as unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LooseRow {
    pub id: i64,
    pub label: String,
}

impl Entity for LooseRow {
    fn mapping() -> EntityMapping {
        EntityMapping::table("loose_rows")
            .column(Column::new("id").primary_key())
            .field("label")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), Value::Text(self.label.clone())]
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub db: Database,
    pub crud: Crud,
}

impl Fixture {
    pub fn path(&self) -> PathBuf {
        self.db.config().path.clone()
    }

    /// Raw connection for assertions that must bypass the crate.
    pub fn raw(&self) -> Connection {
        Connection::open(self.path()).unwrap()
    }

    pub fn row_count(&self, table: &str) -> i64 {
        self.raw()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(|config| config)
}

pub fn fixture_with(configure: impl FnOnce(DatabaseConfig) -> DatabaseConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crudkit.db");

    Connection::open(&path).unwrap().execute_batch(SCHEMA).unwrap();

    let db = Database::open(configure(DatabaseConfig::new(path))).unwrap();
    let crud = Crud::new(db.clone());
    Fixture { dir, db, crud }
}

pub fn customer(name: &str, email: &str, tier: &str, credit: i64) -> Customer {
    Customer {
        id: 0,
        name: name.to_string(),
        email: email.to_string(),
        tier: tier.to_string(),
        credit,
    }
}

/// Inserts `template` through the facade and returns its generated id.
pub fn seed(crud: &Crud, template: &Customer) -> i64 {
    let template = template.clone();
    crud.create(move |_, entity: &mut Customer| {
        *entity = template;
        Ok(())
    })
    .unwrap()
}
