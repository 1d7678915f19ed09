mod common;

use common::{customer, fixture, seed, Customer, Setting};
use crudkit_core::{
    has_ambient_transaction, Crud, CrudError, Database, DatabaseConfig, EntryMode,
    IsolationLevel, Predicate, TransactionScope, UnitOfWork,
};
use std::thread;

fn setting(key: &str) -> Setting {
    Setting {
        key: key.to_string(),
        value: "v".to_string(),
    }
}

fn insert_setting(fx: &common::Fixture, key: &str) {
    let key = key.to_string();
    fx.crud
        .create_with(
            move |_, entity: &mut Setting| {
                *entity = setting(&key);
                Ok(())
            },
            |_| (),
        )
        .unwrap();
}

#[test]
fn scope_without_commit_rolls_back_enclosed_calls() {
    let fx = fixture();

    {
        let scope = TransactionScope::begin(&fx.db).unwrap();
        assert!(scope.is_root());
        assert_eq!(scope.isolation_level(), IsolationLevel::Serializable);
        insert_setting(&fx, "a");
        seed(&fx.crud, &customer("A", "a@example.com", "basic", 0));
        // Enclosed reads see the scope's own uncommitted work.
        assert_eq!(fx.crud.pick_all(&Predicate::<Setting>::all()).unwrap().len(), 1);
    }

    assert!(!has_ambient_transaction(&fx.db));
    assert_eq!(fx.row_count("settings"), 0);
    assert_eq!(fx.row_count("customers"), 0);
}

#[test]
fn committed_scope_persists_every_enclosed_call() {
    let fx = fixture();

    let scope = TransactionScope::begin(&fx.db).unwrap();
    insert_setting(&fx, "a");
    insert_setting(&fx, "b");
    let id = seed(&fx.crud, &customer("A", "a@example.com", "basic", 1));
    fx.crud
        .modify(id, |_, entity: &mut Customer| {
            entity.credit = 2;
            Ok(())
        })
        .unwrap();
    scope.commit().unwrap();
    assert!(scope.is_committed());
    scope.dispose().unwrap();

    assert_eq!(fx.row_count("settings"), 2);
    assert_eq!(fx.crud.get::<Customer>(id).unwrap().unwrap().credit, 2);
}

#[test]
fn failure_midway_through_a_scope_discards_earlier_calls() {
    let fx = fixture();
    seed(&fx.crud, &customer("Existing", "dup@example.com", "basic", 0));

    let result = TransactionScope::run(&fx.db, |_| {
        insert_setting(&fx, "first");
        fx.crud.create(|_, entity: &mut Customer| {
            *entity = customer("Dup", "dup@example.com", "basic", 0);
            Ok(())
        })
    });

    assert!(matches!(result, Err(CrudError::Sqlite(_))));
    assert_eq!(fx.row_count("settings"), 0);
    assert_eq!(fx.row_count("customers"), 1);
}

#[test]
fn run_commits_when_body_succeeds() {
    let fx = fixture();

    let id = TransactionScope::run(&fx.db, |scope| {
        assert!(scope.is_root());
        insert_setting(&fx, "x");
        Ok(seed(&fx.crud, &customer("A", "a@example.com", "basic", 0)))
    })
    .unwrap();

    assert!(fx.crud.get::<Customer>(id).unwrap().is_some());
    assert_eq!(fx.row_count("settings"), 1);
}

#[test]
fn nested_scope_without_commit_dooms_the_transaction() {
    let fx = fixture();

    let outer = TransactionScope::begin(&fx.db).unwrap();
    insert_setting(&fx, "outer");
    {
        let inner = TransactionScope::begin(&fx.db).unwrap();
        assert!(!inner.is_root());
        insert_setting(&fx, "inner");
    }
    outer.commit().unwrap();
    assert!(matches!(outer.dispose(), Err(CrudError::TransactionAborted)));
    assert!(outer.is_disposed());

    assert_eq!(fx.row_count("settings"), 0);
}

#[test]
fn uncommitted_root_over_doomed_transaction_rolls_back_quietly() {
    let fx = fixture();

    let outer = TransactionScope::begin(&fx.db).unwrap();
    insert_setting(&fx, "outer");
    {
        let _inner = TransactionScope::begin(&fx.db).unwrap();
    }
    outer.dispose().unwrap();

    assert_eq!(fx.row_count("settings"), 0);
}

#[test]
fn run_reports_abort_when_a_handled_nested_failure_doomed_the_work() {
    let fx = fixture();

    let result = TransactionScope::run(&fx.db, |_| {
        insert_setting(&fx, "outer");
        let nested: Result<(), CrudError> = TransactionScope::run(&fx.db, |_| {
            insert_setting(&fx, "inner");
            Err(CrudError::InvalidData("nested body failed".to_string()))
        });
        assert!(nested.is_err());
        Ok(42)
    });

    assert!(matches!(result, Err(CrudError::TransactionAborted)));
    assert!(!has_ambient_transaction(&fx.db));
    assert_eq!(fx.row_count("settings"), 0);
}

#[test]
fn differently_spelled_paths_join_the_same_scope() {
    let fx = fixture();
    std::fs::create_dir(fx.dir.path().join("sub")).unwrap();
    let alias = Database::open(DatabaseConfig::new(
        fx.dir.path().join("sub").join("..").join("crudkit.db"),
    ))
    .unwrap();
    assert_ne!(alias.config().path, fx.path());
    let alias_crud = Crud::new(alias.clone());

    let scope = TransactionScope::begin(&fx.db).unwrap();
    assert!(has_ambient_transaction(&alias));
    alias_crud
        .create_with(
            |_, entity: &mut Setting| {
                *entity = setting("via-alias");
                Ok(())
            },
            |_| (),
        )
        .unwrap();
    assert_eq!(fx.crud.pick_all(&Predicate::<Setting>::all()).unwrap().len(), 1);
    scope.commit().unwrap();
    scope.dispose().unwrap();

    assert_eq!(fx.row_count("settings"), 1);
}

#[test]
fn nested_scopes_that_all_commit_persist_together() {
    let fx = fixture();

    TransactionScope::run(&fx.db, |_| {
        insert_setting(&fx, "outer");
        TransactionScope::run(&fx.db, |inner| {
            assert!(!inner.is_root());
            insert_setting(&fx, "inner");
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(fx.row_count("settings"), 2);
}

#[test]
fn unit_outliving_its_scope_cannot_submit() {
    let fx = fixture();

    let scope = TransactionScope::begin(&fx.db).unwrap();
    let mut unit = UnitOfWork::open(&fx.db, EntryMode::Manual).unwrap();
    assert!(unit.context().unwrap().is_ambient());
    unit.table::<Setting>()
        .unwrap()
        .insert_on_submit(&setting("late"))
        .unwrap();
    scope.commit().unwrap();
    scope.dispose().unwrap();

    assert!(matches!(unit.submit(), Err(CrudError::TransactionFinished)));
    assert_eq!(fx.row_count("settings"), 0);
}

#[test]
fn failed_submit_inside_scope_leaves_scope_usable() {
    let fx = fixture();
    seed(&fx.crud, &customer("A", "dup@example.com", "basic", 0));

    let scope = TransactionScope::begin(&fx.db).unwrap();
    let failed = fx.crud.create(|context, entity: &mut Customer| {
        context.table::<Setting>()?.insert_on_submit(&setting("partial"))?;
        *entity = customer("B", "dup@example.com", "basic", 0);
        Ok(())
    });
    assert!(failed.is_err());

    insert_setting(&fx, "after");
    scope.commit().unwrap();
    scope.dispose().unwrap();

    let keys: Vec<String> = fx
        .crud
        .pick_all(&Predicate::<Setting>::all())
        .unwrap()
        .into_iter()
        .map(|s| s.key)
        .collect();
    assert_eq!(keys, vec!["after".to_string()]);
}

#[test]
fn other_threads_do_not_join_or_observe_the_scope() {
    let fx = fixture();

    let scope = TransactionScope::begin(&fx.db).unwrap();
    insert_setting(&fx, "pending");

    thread::scope(|s| {
        s.spawn(|| {
            assert!(!has_ambient_transaction(&fx.db));
            let visible = fx.raw().query_row("SELECT COUNT(*) FROM settings", [], |row| {
                row.get::<_, i64>(0)
            });
            assert_eq!(visible.unwrap(), 0);
        });
    });

    scope.commit().unwrap();
    scope.dispose().unwrap();
    assert_eq!(fx.row_count("settings"), 1);
}
