use std::time::Duration;

use reef_client_core::connection::Connection;
use reef_client_core::error::ViewportError;
use reef_client_core::events::EventBus;
use reef_client_core::registry::SessionRegistry;
use reef_client_core::service::memory::{MemoryEditService, ServiceOp};

fn alphabet(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), bytes).expect("write temp file");
    file
}

fn registry(service: &std::sync::Arc<MemoryEditService>) -> SessionRegistry {
    SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service.clone()),
        EventBus::new(),
        Duration::from_secs(5),
    )
}

#[test_timeout::tokio_timeout_test(20)]
async fn offsets_past_the_end_are_refused_before_any_call() {
    let file = temp_file(&alphabet(100));
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");

    let err = session.create_viewport(500, 10).await.unwrap_err();
    assert!(matches!(
        err,
        ViewportError::OutOfRange {
            offset: 500,
            size: 100
        }
    ));
    assert_eq!(service.call_count(ServiceOp::CreateViewport), 0);
    assert!(session.viewports().is_empty());

    let viewport = session.create_viewport(0, 10).await.expect("viewport");
    service.reset_call_counts();
    let err = viewport.reposition(200).await.unwrap_err();
    assert!(matches!(
        err,
        ViewportError::OutOfRange {
            offset: 200,
            size: 100
        }
    ));
    assert_eq!(service.call_count(ServiceOp::ModifyViewport), 0);
    let window = viewport.snapshot().expect("window kept");
    assert_eq!(window.offset, 0);
    assert_eq!(window.data.as_ref(), &alphabet(10)[..]);

    // The end itself is a valid, empty window.
    let window = viewport.reposition(100).await.expect("reposition to end");
    assert_eq!(window.offset, 100);
    assert!(window.data.is_empty());
    assert_eq!(window.following_byte_count, 0);

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn window_left_past_the_end_by_a_delete_is_pulled_back() {
    let content = alphabet(100);
    let file = temp_file(&content);
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(80, 20).await.expect("viewport");

    session
        .edit(0, content[..60].to_vec(), "")
        .await
        .expect("delete");
    assert_eq!(session.counts().computed_file_size, 40);

    let window = viewport.refresh().await.expect("refresh");
    assert_eq!(window.offset, 20);
    assert_eq!(window.data.as_ref(), &content[80..]);
    assert_eq!(window.following_byte_count, 0);
    assert_eq!(window.end(), session.counts().computed_file_size);

    // Later edits are checked against the shrunken size.
    let err = viewport.reposition(41).await.unwrap_err();
    assert!(matches!(err, ViewportError::OutOfRange { size: 40, .. }));

    registry.close_all().await.expect("close all");
}
