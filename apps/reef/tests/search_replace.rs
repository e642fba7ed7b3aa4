use std::sync::Arc;
use std::time::Duration;

use reef_client_core::connection::Connection;
use reef_client_core::events::EventBus;
use reef_client_core::registry::SessionRegistry;
use reef_client_core::search::{self, Reconciliation};
use reef_client_core::service::SearchQuery;
use reef_client_core::service::memory::{MemoryEditService, ServiceOp};

fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), bytes).expect("write temp file");
    file
}

fn registry(service: &Arc<MemoryEditService>) -> SessionRegistry {
    SessionRegistry::new(
        Connection::new("127.0.0.1", 9000, service.clone()),
        EventBus::new(),
        Duration::from_secs(5),
    )
}

fn mixed_case_content() -> Vec<u8> {
    let mut bytes = vec![b'.'; 30];
    bytes[0..2].copy_from_slice(b"ab");
    bytes[10..12].copy_from_slice(b"AB");
    bytes[20..22].copy_from_slice(b"Ab");
    bytes
}

#[test_timeout::tokio_timeout_test(20)]
async fn case_insensitive_search_reports_every_offset() {
    let file = temp_file(&mixed_case_content());
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let folded = SearchQuery::new("AB").case_insensitive(true);

    let matches = search::search(&session, &folded).await.expect("search");
    assert_eq!(matches, vec![0, 10, 20]);

    let exact = search::search(&session, &SearchQuery::new("AB"))
        .await
        .expect("case-sensitive search");
    assert_eq!(exact, vec![10]);

    let limited = search::search(&session, &folded.clone().limit(2))
        .await
        .expect("limited search");
    assert_eq!(limited, vec![0, 10]);

    let windowed = search::search(&session, &folded.clone().within(5, 20))
        .await
        .expect("windowed search");
    assert_eq!(windowed, vec![10, 20]);

    // Searching never changes the session.
    assert_eq!(session.snapshot().change_count, 0);
    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn replace_all_suppresses_then_flushes_notifications() {
    let file = temp_file(b"needle hay needle hay needle hay needle hay needle");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 64).await.expect("viewport");

    let report = search::replace_all(&session, &SearchQuery::new("needle"), "pin")
        .await
        .expect("replace");
    assert_eq!(report.replaced, 5);
    assert_eq!(report.reconciliation, Reconciliation::Notified);
    assert_eq!(report.metadata.computed_file_size, 50 - 5 * 3);
    assert_eq!(service.call_count(ServiceOp::PauseEvents), 1);
    assert_eq!(service.call_count(ServiceOp::ResumeEvents), 1);
    assert_eq!(service.call_count(ServiceOp::NotifyChanged), 1);

    let expected = b"pin hay pin hay pin hay pin hay pin";
    for _ in 0..200 {
        if viewport.snapshot().map(|w| w.data.as_ref() == expected).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(viewport.read().await.unwrap().data.as_ref(), expected);
    // One flush, not one notification per match.
    assert_eq!(viewport.notification_count(), 1);

    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn failed_notify_falls_back_to_refreshing_the_focused_viewport() {
    let file = temp_file(b"aXaXaX");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 16).await.expect("viewport");

    service.fail_next(ServiceOp::NotifyChanged);
    let report = search::replace_all(&session, &SearchQuery::new("X"), "Y")
        .await
        .expect("replace");
    assert_eq!(report.replaced, 3);
    assert!(matches!(
        report.reconciliation,
        Reconciliation::FallbackRefresh { .. }
    ));

    // The fallback refresh completed before replace_all returned.
    assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"aYaYaY");
    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn failed_resume_is_retried_by_the_next_edit() {
    let file = temp_file(b"aXaXaX");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 16).await.expect("viewport");

    service.fail_next(ServiceOp::ResumeEvents);
    let report = search::replace_all(&session, &SearchQuery::new("X"), "Y")
        .await
        .expect("replace");
    assert!(matches!(
        report.reconciliation,
        Reconciliation::FallbackRefresh { .. }
    ));
    assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"aYaYaY");
    assert!(session.events_suspended());

    session.edit(0, "a", "z").await.expect("edit");
    assert_eq!(service.call_count(ServiceOp::ResumeEvents), 2);
    assert!(!session.events_suspended());

    let expected = b"zYaYaY";
    for _ in 0..200 {
        if viewport.snapshot().map(|w| w.data.as_ref() == expected).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(viewport.read().await.unwrap().data.as_ref(), expected);
    registry.close_all().await.expect("close all");
}

#[test_timeout::tokio_timeout_test(20)]
async fn edits_refresh_viewports_directly_while_events_stay_suspended() {
    let file = temp_file(b"aXaXaX");
    let service = MemoryEditService::new();
    let registry = registry(&service);
    let session = registry.open(file.path(), None).await.expect("open");
    let viewport = session.create_viewport(0, 16).await.expect("viewport");

    service.fail_next(ServiceOp::ResumeEvents);
    service.fail_next(ServiceOp::ResumeEvents);
    search::replace_all(&session, &SearchQuery::new("X"), "Y")
        .await
        .expect("replace");

    session.edit(0, "a", "z").await.expect("edit");
    assert!(session.events_suspended());
    // Refreshed before edit returned; no notification was delivered.
    assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"zYaYaY");

    session.edit(1, "Y", "y").await.expect("second edit");
    assert!(!session.events_suspended());
    assert_eq!(service.call_count(ServiceOp::ResumeEvents), 3);
    registry.close_all().await.expect("close all");
}
