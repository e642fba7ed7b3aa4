use std::time::Duration;

use reef_client_core::connection::Connection;
use reef_client_core::error::{MutationError, ViewportError};
use reef_client_core::events::{EventBus, ReefEvent, VIEWPORT_TOPIC, ViewportEvent};
use reef_client_core::registry::SessionRegistry;
use reef_client_core::service::memory::{MemoryEditService, ServiceOp};
use reef_client_core::viewport::ViewportPhase;

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

async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn drain(sub: &mut reef_bus::Subscription<ReefEvent>) -> Vec<ViewportEvent> {
    let mut events = Vec::new();
    while let Some(Ok(msg)) = sub.try_recv() {
        if let ReefEvent::Viewport(event) = msg.payload {
            events.push(event);
        }
    }
    events
}

#[test_timeout::tokio_timeout_test(20)]
async fn failed_edit_refreshes_every_live_viewport() {
    let file = temp_file(b"abcdef");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    session.create_viewport(0, 3).await.expect("first viewport");
    session.create_viewport(3, 3).await.expect("second viewport");

    service.reset_call_counts();
    service.fail_next(ServiceOp::SubmitChange);
    let err = session.edit(0, "a", "z").await.unwrap_err();
    assert!(matches!(err, MutationError::Rejected { .. }));
    assert_eq!(service.call_count(ServiceOp::ViewportData), 2);
    assert_eq!(session.snapshot().change_count, 0);

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn failed_refresh_keeps_the_last_window_and_says_so() {
    let file = temp_file(b"abcdef");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 6).await.expect("viewport");
    let mut events = registry.events().subscribe(VIEWPORT_TOPIC);

    service.fail_next(ServiceOp::ViewportData);
    let err = viewport.refresh().await.unwrap_err();
    assert!(matches!(err, ViewportError::Refresh { .. }));
    assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"abcdef");
    assert_eq!(viewport.phase(), ViewportPhase::Subscribed);

    let events = drain(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        ViewportEvent::RefreshFailed { viewport_id, .. } if viewport_id == viewport.id()
    )));

    // Nothing retried on its own.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"abcdef");

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn response_landing_after_release_is_discarded() {
    let file = temp_file(b"abcdef");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 6).await.expect("viewport");
    let mut events = registry.events().subscribe(VIEWPORT_TOPIC);

    service.reset_call_counts();
    let _gate = service.gate(ServiceOp::ViewportData);
    let refresh = tokio::spawn({
        let viewport = viewport.clone();
        async move { viewport.refresh().await }
    });
    eventually(
        || service.call_count(ServiceOp::ViewportData) == 1,
        "the fetch to start",
    )
    .await;

    session.release_viewport(viewport.id()).await;
    service.release_gate(ServiceOp::ViewportData);

    let result = refresh.await.expect("refresh task");
    assert!(matches!(result, Err(ViewportError::Released(_))));
    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|event| matches!(event, ViewportEvent::Released { .. })));
    assert!(!events.iter().any(|event| matches!(
        event,
        ViewportEvent::Refreshed(_) | ViewportEvent::RefreshFailed { .. }
    )));

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn reposition_holds_readers_until_its_fetch_lands() {
    let file = temp_file(b"0123456789");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 4).await.expect("viewport");
    let mut phase = viewport.watch_phase();

    let _gate = service.gate(ServiceOp::ModifyViewport);
    let reposition = tokio::spawn({
        let viewport = viewport.clone();
        async move { viewport.reposition(4).await }
    });
    phase
        .wait_for(|phase| *phase == ViewportPhase::Refreshing)
        .await
        .expect("phase channel open");

    assert!(matches!(
        viewport.snapshot(),
        Err(ViewportError::Refreshing(_))
    ));
    let read = tokio::spawn({
        let viewport = viewport.clone();
        async move { viewport.read().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!read.is_finished());

    service.release_gate(ServiceOp::ModifyViewport);
    let moved = reposition.await.expect("reposition task").expect("reposition");
    assert_eq!(moved.offset, 4);
    assert_eq!(moved.data.as_ref(), b"4567");
    let seen = read.await.expect("read task").expect("read");
    assert_eq!(seen, moved);
    assert_eq!(*phase.borrow_and_update(), ViewportPhase::Subscribed);

    registry.close_all().await.expect("close all");
}
