//! Offline persistence across client restarts.

mod common;

use common::Setup;
use serde_json::json;
use std::sync::Arc;
use tidewire_client::{ClientConfig, FileStore, Message, OfflineStore, RecordState};
use tidewire_protocol::RecordAction;

fn config() -> ClientConfig {
    ClientConfig::new().with_offline_enabled(true)
}

#[test]
fn dirty_records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn OfflineStore> = Arc::new(FileStore::open(dir.path()).unwrap());

    let first = Setup::connected_with_storage(config(), Arc::clone(&store));
    let record = first.client.records().get_record("doc").unwrap();
    first.deliver([Message::named(RecordAction::ReadResponse, "doc")
        .with_version(1)
        .with_data(json!({"n": 1}))]);
    first.lose_connection();
    record.set(Some("n"), json!(2)).unwrap();
    first.client.close();
    drop(record);
    drop(first);

    let store: Arc<dyn OfflineStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let second = Setup::with_storage(config(), store);
    let records = second.client.records();
    assert_eq!(records.dirty_names(), vec!["doc"]);

    let record = records.get_record("doc").unwrap();
    assert_eq!(record.state(), Some(RecordState::Ready));
    assert_eq!(record.version(), Some(2));
    assert_eq!(record.get(Some("n")), Some(json!(2)));
}

#[test]
fn records_created_offline_start_at_the_initial_version() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn OfflineStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let setup = Setup::with_storage(config().with_initial_record_version(1), Arc::clone(&store));

    let record = setup.client.records().get_record("draft").unwrap();
    assert!(record.is_ready());
    assert_eq!(record.version(), Some(1));
    record.set(Some("title"), json!("hello")).unwrap();

    let snapshot = store.get("draft").unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.data, json!({"title": "hello"}));
    assert_eq!(setup.client.records().dirty_names(), vec!["draft"]);
}

#[test]
fn created_offline_record_is_created_on_the_server() {
    let setup = Setup::new(config());
    let record = setup.client.records().get_record("draft").unwrap();
    record.set(Some("title"), json!("hello")).unwrap();

    setup.client.login_with(None, |_| {});
    setup.handshake();
    let head = setup.sent_with(RecordAction::SubscribeAndHead);
    assert_eq!(head.len(), 1);

    setup.deliver([Message::named(RecordAction::HeadResponse, "draft").with_version(-1)]);
    let create = setup.sent_with(RecordAction::CreateAndUpdate);
    assert_eq!(create.len(), 1);
    assert_eq!(create[0].version, Some(1));
    assert_eq!(create[0].data, Some(json!({"title": "hello"})));
    assert!(setup.client.records().dirty_names().is_empty());
}
