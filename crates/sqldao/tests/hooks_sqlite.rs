mod common;

use common::{Country, country, session, session_with};
use sqldao::prelude::*;
use std::sync::{Arc, Mutex};

fn recorder() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: &ChangeEvent| {
        sink.lock().unwrap().push(event.clone());
    })
}

#[test]
fn sqlite_hook_sees_changes_in_order() {
    let (session, _log) = session();
    let (seen, callback) = recorder();
    session
        .with_hook(callback, |s| {
            let peru = country(s, "Peru");
            s.flush()?;
            peru.handle().set("name", "Perú")?;
            peru.handle().save()?;
            s.flush()?;
            peru.handle().delete()
        })
        .unwrap();

    let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Created, ChangeKind::Updated, ChangeKind::Removed]
    );
    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|e| e.table == "country" && e.id == EntityId::Int(1)));
    assert!(seen.windows(2).all(|w| w[0].transaction_id == w[1].transaction_id));
    assert!(session.event_bus().is_empty());
}

#[test]
fn sqlite_failed_hook_body_delivers_nothing() {
    let (session, _log) = session();
    let (seen, callback) = recorder();
    let result: Result<()> = session.with_hook(callback, |s| {
        country(s, "Peru");
        s.flush()?;
        Err(Error::Custom("stop".to_string()))
    });
    assert!(result.is_err());
    assert!(session.event_bus().is_empty());

    session.rollback().unwrap();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn sqlite_events_are_buffered_until_commit() {
    let (session, _log) = session();
    let (seen, callback) = recorder();
    let subscription = session.event_bus().subscribe(callback);

    country(&session, "Peru");
    session.flush().unwrap();
    assert_eq!(session.registered_changes().len(), 1);
    assert!(seen.lock().unwrap().is_empty());

    session.commit().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(session.registered_changes().is_empty());
    assert!(session.event_bus().unsubscribe(subscription));
}

#[test]
fn sqlite_sessions_share_an_injected_bus() {
    let bus = EventBus::new();
    let (first, _) = session_with(&bus);
    let (second, _) = session_with(&bus);
    let (seen, callback) = recorder();
    bus.subscribe(callback);

    country(&first, "Peru");
    first.commit().unwrap();
    country(&second, "Chile");
    second.commit().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn sqlite_rolled_back_changes_are_not_delivered() {
    let (session, _log) = session();
    let (seen, callback) = recorder();
    session.event_bus().subscribe(callback);

    country(&session, "Peru");
    session.flush().unwrap();
    session.rollback().unwrap();
    session.commit().unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert!(session.objects::<Country>().unwrap().is_empty().unwrap());
}

#[test]
fn sqlite_change_events_serialize() {
    let (session, _log) = session();
    country(&session, "Peru");
    session.flush().unwrap();
    let changes = session.registered_changes();
    let json = serde_json::to_string(&changes).unwrap();
    let back: Vec<ChangeEvent> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, changes);
}
