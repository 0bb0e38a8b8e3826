mod common;

use common::{Country, Person, Region, country, name_of, person, session};
use sqldao::prelude::*;

fn count_rows(session: &Session, table: &str) -> i64 {
    let rows = session
        .connection()
        .query(&format!("SELECT COUNT(*) FROM {table}"), &[])
        .expect("count rows");
    rows[0].get(0).and_then(Value::as_i64).expect("count value")
}

#[test]
fn sqlite_peru_and_lima_get_sequential_identities() {
    let (session, _log) = session();
    let peru = country(&session, "Peru");
    let lima = session
        .create::<Region>(|r| {
            r.handle().set("name", "Lima")?;
            r.handle().set_related("country", Some(peru.handle()))
        })
        .unwrap();
    session.commit().unwrap();

    assert_eq!(peru.handle().id().unwrap(), Some(EntityId::Int(1)));
    assert_eq!(lima.handle().id().unwrap(), Some(EntityId::Int(1)));
    let rows = session
        .connection()
        .query("SELECT country_id FROM region WHERE id = ?1", &[Value::Int(1)])
        .unwrap();
    assert_eq!(rows[0].get(0).and_then(Value::as_i64), Some(1));
}

#[test]
fn sqlite_identity_is_a_singleton_per_transaction() {
    let (session, log) = session();
    country(&session, "Peru");
    session.commit().unwrap();

    let from_query = session.objects::<Country>().unwrap().first().unwrap();
    let by_id = session.objects::<Country>().unwrap().get_by_id(1).unwrap().unwrap();
    let lazy = session.lazy::<Country>(1).unwrap();
    assert_eq!(from_query.handle(), by_id.handle());
    assert_eq!(from_query.handle(), lazy.handle());
    // get_by_id and lazy are answered from the cache
    assert_eq!(log.count(), 1);
}

#[test]
fn sqlite_setting_the_visible_value_writes_nothing() {
    let (session, log) = session();
    country(&session, "Peru");
    session.commit().unwrap();

    let peru = session.objects::<Country>().unwrap().first().unwrap();
    let (result, statements) = log.during(|| {
        peru.handle().set("name", "Peru")?;
        assert!(!peru.handle().is_dirty());
        peru.handle().save()?;
        session.flush()
    });
    let stats = result.unwrap();
    assert_eq!(stats.updated, 0);
    assert!(statements.is_empty(), "unexpected statements: {statements:?}");
}

#[test]
fn sqlite_setting_the_stored_value_after_commit_writes_nothing() {
    let (session, log) = session();
    let peru = country(&session, "Peru");
    session.commit().unwrap();
    assert!(!peru.handle().is_loaded());

    let (result, statements) = log.during(|| {
        peru.handle().set("name", "Peru")?;
        assert!(!peru.handle().is_dirty());
        peru.handle().save()?;
        session.commit()
    });
    result.unwrap();
    assert_eq!(name_of(&peru), "Peru");
    assert!(
        statements.iter().all(|s| !s.starts_with("UPDATE")),
        "unexpected update: {statements:?}"
    );
}

#[test]
fn sqlite_insert_applies_declared_default() {
    let (session, _log) = session();
    let peru = country(&session, "Peru");
    session.flush().unwrap();
    assert_eq!(peru.handle().get_as::<i64>("population").unwrap(), 0);
    session.commit().unwrap();

    let reloaded = session.objects::<Country>().unwrap().get_by_id(1).unwrap().unwrap();
    assert_eq!(reloaded.handle().get_as::<i64>("population").unwrap(), 0);
}

#[test]
fn sqlite_missing_required_column_is_rejected_before_insert() {
    let (session, log) = session();
    let err = session
        .create::<Region>(|r| r.handle().set("name", "Lima"))
        .err()
        .expect("country_id is required");
    match err.as_orm() {
        Some(OrmError::NotNull { table, column }) => {
            assert_eq!(table, "region");
            assert_eq!(column, "country_id");
        }
        other => panic!("expected not-null violation, got {other:?}"),
    }
    assert_eq!(err.to_string(), "region.country_id column not allow nulls");
    session.commit().unwrap();
    assert_eq!(log.count(), 0);
    assert_eq!(count_rows(&session, "region"), 0);
}

#[test]
fn sqlite_related_identity_needs_no_query() {
    let (session, log) = session();
    let peru = country(&session, "Peru");
    session
        .create::<Region>(|r| {
            r.handle().set("name", "Lima")?;
            r.handle().set_related("country", Some(peru.handle()))
        })
        .unwrap();
    session.commit().unwrap();

    let lima = session.objects::<Region>().unwrap().first().unwrap();
    let (country, statements) = log.during(|| {
        let country = lima.handle().related_as::<Country>("country").unwrap().unwrap();
        assert_eq!(country.handle().id().unwrap(), Some(EntityId::Int(1)));
        country
    });
    assert!(statements.is_empty());
    assert!(!country.handle().is_loaded());

    let (_, statements) = log.during(|| assert_eq!(name_of(&country), "Peru"));
    assert_eq!(statements.len(), 1);
    let (_, statements) = log.during(|| {
        assert_eq!(country.handle().get_as::<i64>("population").unwrap(), 0);
    });
    assert!(statements.is_empty());
}

#[test]
fn sqlite_self_reference_resolves_generated_identity() {
    let (session, _log) = session();
    let first = person(&session, "first", None);
    person(&session, "second", None);
    session
        .create::<Person>(|p| {
            p.handle().set("name", "third")?;
            p.handle().set_related("parent", Some(first.handle()))
        })
        .unwrap();
    session.commit().unwrap();

    let rows = session
        .connection()
        .query("SELECT id, parent_id FROM person ORDER BY id", &[])
        .unwrap();
    let ids: Vec<Option<i64>> = rows.iter().map(|r| r.get(0).and_then(Value::as_i64)).collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(rows[2].get(1).and_then(Value::as_i64), Some(1));
    assert!(rows[0].get(1).is_some_and(Value::is_null));
}

#[test]
fn sqlite_mutual_references_deadlock() {
    let (session, log) = session();
    let a = session.new_entity::<Person>().unwrap();
    let b = session.new_entity::<Person>().unwrap();
    a.handle().set("name", "a").unwrap();
    b.handle().set("name", "b").unwrap();
    a.handle().set_related("parent", Some(b.handle())).unwrap();
    b.handle().set_related("parent", Some(a.handle())).unwrap();
    a.handle().save().unwrap();

    let err = session.flush().unwrap_err();
    match err.as_orm() {
        Some(OrmError::SelfReferencingDeadlock { tables, columns }) => {
            assert_eq!(tables, &vec!["person".to_string()]);
            assert_eq!(columns, &vec!["person.parent_id".to_string()]);
        }
        other => panic!("expected deadlock, got {other:?}"),
    }
    assert!(log.statements().iter().all(|s| !s.starts_with("INSERT")));
}

#[test]
fn sqlite_unsaved_write_does_not_block_saved_insert() {
    let (session, _log) = session();
    let peru = country(&session, "Peru");
    let lima = session
        .create::<Region>(|r| {
            r.handle().set("name", "Lima")?;
            r.handle().set_related("country", Some(peru.handle()))
        })
        .unwrap();
    let chile = session.new_entity::<Country>().unwrap();
    chile.handle().set("name", "Chile").unwrap();
    lima.handle()
        .set_related("country", Some(chile.handle()))
        .unwrap();

    let stats = session.flush().unwrap();
    assert_eq!(stats.inserted, 2);
    assert!(!lima.handle().is_new());
    assert!(chile.handle().is_new());
    assert!(lima.handle().is_dirty());
    let rows = session
        .connection()
        .query("SELECT country_id FROM region", &[])
        .unwrap();
    assert_eq!(rows[0].get(0).and_then(Value::as_i64), Some(1));
    assert_eq!(
        lima.handle().related("country").unwrap().unwrap(),
        *chile.handle()
    );
}

#[test]
fn sqlite_reload_restores_persisted_value() {
    let (session, log) = session();
    country(&session, "Peru");
    session.commit().unwrap();

    let peru = session.objects::<Country>().unwrap().first().unwrap();
    peru.handle().set("name", "Chile").unwrap();
    peru.handle().reload(false).unwrap();
    assert_eq!(name_of(&peru), "Peru");
    assert!(!peru.handle().is_dirty());

    peru.handle().set("name", "Bolivia").unwrap();
    peru.handle().save().unwrap();
    peru.handle().reload(true).unwrap();
    assert_eq!(name_of(&peru), "Peru");
    session.commit().unwrap();
    assert!(log.statements().iter().all(|s| !s.starts_with("UPDATE")));
}

#[test]
fn sqlite_refresh_of_deleted_row_is_none() {
    let (session, _log) = session();
    country(&session, "Peru");
    session.commit().unwrap();

    let peru = session.objects::<Country>().unwrap().first().unwrap();
    session
        .connection()
        .execute("DELETE FROM country", &[])
        .unwrap();
    assert!(peru.handle().refresh_or_none().unwrap().is_none());
    let err = peru.handle().reload(false).unwrap_err();
    assert!(matches!(err.as_orm(), Some(OrmError::EntityNotFound { .. })));
}

#[test]
fn sqlite_rollback_clears_cache_and_reverts_inserts() {
    let (session, _log) = session();
    let peru = country(&session, "Peru");
    session.flush().unwrap();
    assert!(!peru.handle().is_new());

    session.rollback().unwrap();
    assert!(peru.handle().is_new());
    assert!(session.objects::<Country>().unwrap().is_empty().unwrap());
}

#[test]
fn sqlite_resave_after_rollback_links_regenerated_identity() {
    let (session, _log) = session();
    country(&session, "Chile");
    session.commit().unwrap();

    let peru = country(&session, "Peru");
    let lima = session
        .create::<Region>(|r| {
            r.handle().set("name", "Lima")?;
            r.handle().set_related("country", Some(peru.handle()))
        })
        .unwrap();
    session.flush().unwrap();
    assert_eq!(peru.handle().id().unwrap(), Some(EntityId::Int(2)));
    session.rollback().unwrap();

    // takes the identity Peru held before the rollback
    let bolivia = country(&session, "Bolivia");
    session.flush().unwrap();
    assert_eq!(bolivia.handle().id().unwrap(), Some(EntityId::Int(2)));

    peru.handle().save().unwrap();
    lima.handle().save().unwrap();
    session.commit().unwrap();
    assert_eq!(peru.handle().id().unwrap(), Some(EntityId::Int(3)));
    let rows = session
        .connection()
        .query("SELECT country_id FROM region WHERE name = ?1", &[Value::from("Lima")])
        .unwrap();
    assert_eq!(rows[0].get(0).and_then(Value::as_i64), Some(3));
    let owner = lima.handle().related_as::<Country>("country").unwrap().unwrap();
    assert_eq!(name_of(&owner), "Peru");
}

#[test]
fn sqlite_transaction_rolls_back_failed_body() {
    let (session, _log) = session();
    let result: Result<()> = session.transaction(|s| {
        country(s, "Peru");
        s.flush()?;
        Err(Error::Custom("abort".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(count_rows(&session, "country"), 0);

    session
        .transaction(|s| {
            country(s, "Chile");
            Ok(())
        })
        .unwrap();
    assert_eq!(count_rows(&session, "country"), 1);
}

#[test]
fn sqlite_cross_session_reference_is_rejected() {
    let (first, _) = session();
    let (second, _) = session();
    let peru = country(&first, "Peru");
    let lima = second.new_entity::<Region>().unwrap();
    let err = lima
        .handle()
        .set_related("country", Some(peru.handle()))
        .unwrap_err();
    assert!(matches!(
        err.as_orm(),
        Some(OrmError::CrossDatabaseReference { .. })
    ));
}

#[test]
fn sqlite_delete_removes_row() {
    let (session, _log) = session();
    let peru = country(&session, "Peru");
    country(&session, "Chile");
    session.commit().unwrap();

    peru.handle().delete().unwrap();
    session.commit().unwrap();
    let names: Vec<String> = session
        .objects::<Country>()
        .unwrap()
        .all()
        .unwrap()
        .iter()
        .map(name_of)
        .collect();
    assert_eq!(names, vec!["Chile".to_string()]);
}
