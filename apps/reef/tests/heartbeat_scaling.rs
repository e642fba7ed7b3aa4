use std::time::Duration;

use reef_client_core::connection::Connection;
use reef_client_core::events::{EventBus, HEARTBEAT_TOPIC, HeartbeatEvent, ReefEvent};
use reef_client_core::registry::SessionRegistry;
use reef_client_core::service::memory::{MemoryEditService, ServiceOp};

const BASE: Duration = Duration::from_millis(1000);

fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), bytes).expect("write temp file");
    file
}

#[test_timeout::tokio_timeout_test(20, paused)]
async fn interval_tracks_the_number_of_open_sessions() {
    let a = temp_file(b"a");
    let b = temp_file(b"b");
    let service = MemoryEditService::new();
    let registry = SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service.clone()),
        EventBus::new(),
        BASE,
    );
    assert!(!registry.heartbeat().is_running());

    let first = registry.open(a.path(), None).await.expect("open a");
    assert_eq!(registry.heartbeat().current_interval(), Some(BASE));

    let second = registry.open(b.path(), None).await.expect("open b");
    assert_eq!(registry.heartbeat().current_interval(), Some(BASE * 2));

    registry.close(second.id()).await.expect("close b");
    assert_eq!(registry.heartbeat().current_interval(), Some(BASE));

    registry.close(first.id()).await.expect("close a");
    assert!(!registry.heartbeat().is_running());
    assert_eq!(registry.heartbeat().current_interval(), None);
}

#[test_timeout::tokio_timeout_test(20, paused)]
async fn samples_arrive_at_the_scaled_cadence() {
    let a = temp_file(b"a");
    let b = temp_file(b"b");
    let service = MemoryEditService::new();
    let events = EventBus::new();
    let mut beats = events.subscribe(HEARTBEAT_TOPIC);
    let registry = SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service.clone()),
        events,
        BASE,
    );
    registry.open(a.path(), None).await.expect("open a");
    registry.open(b.path(), None).await.expect("open b");

    // Two sessions: nothing before 2s, one probe right after.
    tokio::time::sleep(BASE + Duration::from_millis(500)).await;
    assert_eq!(service.call_count(ServiceOp::Heartbeat), 0);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(service.call_count(ServiceOp::Heartbeat), 1);

    let msg = beats.recv().await.expect("heartbeat event");
    let ReefEvent::Heartbeat(HeartbeatEvent::Tick(sample)) = msg.payload else {
        panic!("expected a tick, got {:?}", msg.payload);
    };
    assert_eq!(sample.session_count, 2);
    assert_eq!(registry.heartbeat().latest(), Some(sample));

    registry.close_all().await.expect("close all");
    tokio::time::sleep(BASE * 4).await;
    assert_eq!(service.call_count(ServiceOp::Heartbeat), 1);
}
