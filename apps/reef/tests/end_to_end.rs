use std::time::Duration;

use clap::Parser;
use reef_client_core::cli::{self, Cli};
use reef_client_core::connection::Connection;
use reef_client_core::events::{EventBus, ReefEvent, VIEWPORT_TOPIC, ViewportEvent};
use reef_client_core::registry::SessionRegistry;
use reef_client_core::service::memory::MemoryEditService;
use reef_client_core::viewport::ViewportPhase;

fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), bytes).expect("write temp file");
    file
}

#[test_timeout::tokio_timeout_test(20)]
async fn edit_is_reflected_in_subscribed_viewport() {
    let contents: Vec<u8> = (0..100u8).collect();
    let file = temp_file(&contents);
    let service = MemoryEditService::new();
    let events = EventBus::new();
    let mut viewport_events = events.subscribe(VIEWPORT_TOPIC);
    let registry = SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service.clone()),
        events,
        Duration::from_secs(5),
    );

    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 50).await.expect("viewport");
    assert_eq!(viewport.phase(), ViewportPhase::Subscribed);
    let window = viewport.read().await.expect("initial window");
    assert_eq!(window.data.as_ref(), &contents[..50]);
    assert_eq!(window.following_byte_count, 50);

    // Drain the initial Refreshed event.
    while viewport_events.try_recv().is_some() {}

    session.edit(0, vec![0u8], vec![0xffu8]).await.expect("edit");

    let refreshed = loop {
        let msg = viewport_events.recv().await.expect("viewport event");
        if let ReefEvent::Viewport(ViewportEvent::Refreshed(snapshot)) = msg.payload {
            break snapshot;
        }
    };
    assert_eq!(refreshed.data[0], 0xff);
    assert_eq!(&refreshed.data[1..], &contents[1..50]);

    let meta = session.snapshot();
    assert_eq!(meta.change_count, 1);
    assert_eq!(meta.computed_file_size, 100);
    assert!(refreshed.offset + refreshed.length() <= meta.computed_file_size);
    assert_eq!(viewport.notification_count(), 1);

    registry.close(session.id()).await.expect("close");
    assert!(viewport.is_released());
    assert_eq!(service.session_count(), 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn viewport_reposition_moves_the_window() {
    let contents: Vec<u8> = (0..100u8).collect();
    let file = temp_file(&contents);
    let service = MemoryEditService::new();
    let registry = SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service),
        EventBus::new(),
        Duration::from_secs(5),
    );
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 16).await.expect("viewport");

    let moved = viewport.reposition(90).await.expect("reposition");
    assert_eq!(moved.offset, 90);
    assert_eq!(moved.data.as_ref(), &contents[90..]);
    assert_eq!(moved.following_byte_count, 0);
    assert_eq!(viewport.offset(), 90);

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn cli_edit_with_memory_backend_writes_the_file() {
    let file = temp_file(b"hello world");
    let path = file.path().to_str().expect("utf-8 temp path").to_string();
    let cli = Cli::try_parse_from([
        "reef",
        "--backend",
        "memory",
        "edit",
        path.as_str(),
        "6",
        "57 4f",
        "--yes",
    ])
    .expect("parse args");

    cli::app::run(cli).await.expect("edit command");
    assert_eq!(std::fs::read(file.path()).unwrap(), b"hello WOrld");
}
