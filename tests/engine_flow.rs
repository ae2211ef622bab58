//! Engine scenarios: catalog load through the façade, cache miss to network
//! fetch, authentication flows.

mod common;

use common::{HoldingTransport, ScriptedTransport};
use std::sync::Arc;
use std::time::Duration;
use stockroom::{
    Catalog, Category, Color, Core, CoreConfig, Event, FormatVersion, Item, ItemKey, ItemType,
    Outcome, TransferJob, Transport, UpdateStatus,
};
use tempfile::TempDir;

fn write_catalog(dir: &TempDir) {
    let mut part = ItemType::new('P', "Part");
    part.set_has_colors(true);
    let mut catalog = Catalog::new();
    catalog.replace(
        vec![Color::new(4, "Red"), Color::new(11, "Black")],
        vec![Category::new(5, "Brick")],
        vec![part, ItemType::new('S', "Set")],
        vec![
            Item::new('P', "3001", "Brick 2 x 4"),
            Item::new('S', "7190-1", "Millennium Falcon"),
        ],
        Vec::new(),
    );
    catalog
        .save(&dir.path().join("database"), FormatVersion::Chunked)
        .unwrap();
}

fn engine(dir: &TempDir) -> (Arc<ScriptedTransport>, Core) {
    let transport = Arc::new(ScriptedTransport::default());
    let mut config = CoreConfig::new(dir.path());
    config.disk_load_workers = Some(2);
    let core = Core::new(config, Arc::clone(&transport) as Arc<dyn Transport>).unwrap();
    (transport, core)
}

fn pump_until<F: Fn(&Event) -> bool>(
    core: &mut Core,
    rx: &crossbeam::channel::Receiver<Event>,
    want: F,
) -> Event {
    for _ in 0..500 {
        core.process_events();
        while let Ok(event) = rx.try_recv() {
            if want(&event) {
                return event;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("expected event never arrived");
}

#[test]
fn catalog_loads_through_the_facade() {
    let dir = TempDir::new().unwrap();
    write_catalog(&dir);
    let (_transport, mut core) = engine(&dir);

    core.load_catalog(None).unwrap();
    assert_eq!(core.catalog().items().len(), 2);
    assert!(core.catalog().item('P', "3001").is_some());
    assert!(core.catalog().color_by_name("red").is_some());
}

#[test]
fn picture_miss_fetches_exactly_once() {
    let dir = TempDir::new().unwrap();
    write_catalog(&dir);
    let (transport, mut core) = engine(&dir);
    core.load_catalog(None).unwrap();
    let rx = core.subscribe();

    transport.respond(
        "3001.png",
        Outcome::Completed {
            code: 200,
            body: b"image".to_vec(),
        },
    );

    let handle = core
        .picture(ItemKey::new('P', "3001"), Some(4), false)
        .unwrap();
    let event = pump_until(&mut core, &rx, |e| matches!(e, Event::PictureUpdated(_)));

    match event {
        Event::PictureUpdated(key) => {
            assert_eq!(key.item, ItemKey::new('P', "3001"));
            assert_eq!(key.color, Some(4));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(handle.lock().status, UpdateStatus::Ok);
    assert_eq!(handle.lock().payload.image, b"image");
    assert_eq!(
        transport
            .requests()
            .iter()
            .filter(|u| u.contains("3001"))
            .count(),
        1
    );
}

#[test]
fn authenticated_passthrough_with_login() {
    let dir = TempDir::new().unwrap();
    let (transport, mut core) = engine(&dir);
    let rx = core.subscribe();

    transport.respond(
        "loginandout",
        Outcome::Completed {
            code: 200,
            body: br#"{"returnCode": 0}"#.to_vec(),
        },
    );
    transport.respond(
        "orders",
        Outcome::Completed {
            code: 200,
            body: b"order list".to_vec(),
        },
    );

    core.set_credentials("brick", "secret");
    assert!(!core.is_authenticated());

    let id = core.retrieve_authenticated(TransferJob::get(
        "https://example.test/orders?viewtype=received",
    ));
    core.process_events();

    let mut saw_auth = false;
    let mut saw_result = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::AuthenticationChanged(true) => saw_auth = true,
            Event::TransferFinished(result) => {
                assert_eq!(result.id, id);
                assert!(matches!(result.outcome, Outcome::Completed { code: 200, .. }));
                saw_result = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_auth);
    assert!(saw_result);
    assert!(core.is_authenticated());
}

#[test]
fn failed_login_reports_the_message() {
    let dir = TempDir::new().unwrap();
    let (transport, mut core) = engine(&dir);
    let rx = core.subscribe();

    transport.respond(
        "loginandout",
        Outcome::Completed {
            code: 200,
            body: br#"{"returnCode": 2, "returnMessage": "Invalid password"}"#.to_vec(),
        },
    );

    core.set_credentials("brick", "nope");
    core.retrieve_authenticated(TransferJob::get("https://example.test/orders"));
    core.process_events();

    let mut failure = None;
    while let Ok(event) = rx.try_recv() {
        if let Event::AuthenticationFailed { user, error } = event {
            failure = Some((user, error));
        }
    }
    let (user, error) = failure.expect("login failure must be reported");
    assert_eq!(user, "brick");
    assert_eq!(error, "Invalid password");
    assert!(!core.is_authenticated());
}

#[test]
fn expired_session_relogs_in_transparently() {
    let dir = TempDir::new().unwrap();
    let (transport, mut core) = engine(&dir);
    let rx = core.subscribe();

    let login_ok = Outcome::Completed {
        code: 200,
        body: br#"{"returnCode": 0}"#.to_vec(),
    };
    transport.respond("loginandout", login_ok.clone());
    // the first order fetch bounces to the login page; after the re-login
    // the replayed fetch goes through
    transport.respond_with_redirect(
        "orders",
        Outcome::Failed {
            code: 302,
            error: "moved".into(),
        },
        Some("https://example.test/login.page?redirect=orders"),
    );
    transport.respond("loginandout", login_ok);
    transport.respond(
        "orders",
        Outcome::Completed {
            code: 200,
            body: b"order list".to_vec(),
        },
    );

    core.set_credentials("brick", "secret");
    let id = core.retrieve_authenticated(TransferJob::get("https://example.test/orders"));
    core.process_events();

    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::AuthenticationChanged(true) => {}
            Event::TransferFinished(result) => finished = Some(result),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let result = finished.expect("the replayed job must complete");
    assert_eq!(result.id, id);
    assert!(matches!(result.outcome, Outcome::Completed { code: 200, .. }));
    assert_eq!(
        transport
            .requests()
            .iter()
            .filter(|u| u.contains("loginandout"))
            .count(),
        2
    );
}

#[test]
fn catalog_replacement_clears_object_caches() {
    let dir = TempDir::new().unwrap();
    write_catalog(&dir);
    let (transport, mut core) = engine(&dir);
    core.load_catalog(None).unwrap();
    let rx = core.subscribe();

    transport.respond(
        "3001.png",
        Outcome::Completed {
            code: 200,
            body: b"image".to_vec(),
        },
    );
    let handle = core
        .picture(ItemKey::new('P', "3001"), Some(4), false)
        .unwrap();
    pump_until(&mut core, &rx, |e| matches!(e, Event::PictureUpdated(_)));

    // release the handle, then replace the catalog; the cache entry must go
    core.release_picture(&handle);
    core.load_catalog(None).unwrap();

    transport.respond(
        "3001.png",
        Outcome::Completed {
            code: 200,
            body: b"image".to_vec(),
        },
    );
    let fresh = core
        .picture(ItemKey::new('P', "3001"), Some(4), false)
        .unwrap();
    assert!(!Arc::ptr_eq(&handle, &fresh));
}

#[test]
fn going_offline_mid_update_fails_the_refresh() {
    let dir = TempDir::new().unwrap();
    write_catalog(&dir);
    let transport = Arc::new(HoldingTransport::default());
    let mut config = CoreConfig::new(dir.path());
    config.disk_load_workers = Some(2);
    let mut core = Core::new(config, Arc::clone(&transport) as Arc<dyn Transport>).unwrap();
    core.load_catalog(None).unwrap();
    let rx = core.subscribe();

    // both misses go straight to network refreshes the transport holds open
    let picture = core
        .picture(ItemKey::new('P', "3001"), Some(4), true)
        .unwrap();
    let guide = core.price_guide(ItemKey::new('P', "3001"), 4, true).unwrap();
    assert_eq!(picture.lock().status, UpdateStatus::Updating);
    assert_eq!(guide.lock().status, UpdateStatus::Updating);
    assert_eq!(transport.in_flight(), 2);

    core.set_online(false);
    core.process_events();

    assert_eq!(picture.lock().status, UpdateStatus::UpdateFailed);
    assert_eq!(guide.lock().status, UpdateStatus::UpdateFailed);
    assert_eq!(transport.in_flight(), 0);

    let mut seen = 0;
    while let Ok(event) = rx.try_recv() {
        assert!(matches!(
            event,
            Event::PictureUpdated(_) | Event::PriceGuideUpdated(_)
        ));
        seen += 1;
    }
    assert_eq!(seen, 2);
}

#[test]
fn going_offline_cancels_cleanly() {
    let dir = TempDir::new().unwrap();
    write_catalog(&dir);
    let (_transport, mut core) = engine(&dir);
    core.load_catalog(None).unwrap();

    core.set_online(false);
    assert!(!core.is_online());

    // offline access must fail the refresh without touching the network
    let rx = core.subscribe();
    let handle = core
        .picture(ItemKey::new('P', "3001"), Some(4), true)
        .unwrap();
    core.process_events();
    assert_eq!(handle.lock().status, UpdateStatus::UpdateFailed);
    assert!(matches!(rx.try_recv(), Ok(Event::PictureUpdated(_))));

    core.set_online(true);
    assert!(core.is_online());
}
