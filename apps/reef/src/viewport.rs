//! Bounded, eventually consistent mirror of one byte range of a session.
//!
//! A viewport moves through `Unsubscribed → Subscribed ⇄ Refreshing → Released`.
//! Change notifications are coalesced: however many arrive while a fetch is in
//! flight, at most one more fetch follows it. Every fetch replaces the whole
//! window at once, so readers never see a half-applied buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ViewportError;
use crate::events::{EventBus, ViewportEvent};
use crate::service::{
    EditService, NotificationStream, ServiceError, SessionId, ViewportData, ViewportId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportPhase {
    Unsubscribed,
    Subscribed,
    /// A reposition or the initial fetch is in flight; the held window may be
    /// for the wrong offset.
    Refreshing,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportSnapshot {
    pub viewport_id: ViewportId,
    pub session_id: SessionId,
    pub offset: u64,
    pub capacity: u64,
    pub data: Bytes,
    /// Bytes of session content past the end of this window.
    pub following_byte_count: u64,
}

impl ViewportSnapshot {
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length()
    }
}

struct ViewportInner {
    id: ViewportId,
    session_id: SessionId,
    capacity: u64,
    /// Computed size of the owning session as last reported to it.
    content_size: Arc<AtomicU64>,
    service: Arc<dyn EditService>,
    events: EventBus,
    window: RwLock<Arc<ViewportSnapshot>>,
    phase: watch::Sender<ViewportPhase>,
    fetch_lock: tokio::sync::Mutex<()>,
    pending: Arc<Notify>,
    notifications: Arc<AtomicU64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ViewportInner {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}

/// Cloneable handle; all clones share one window.
#[derive(Clone)]
pub struct Viewport {
    inner: Arc<ViewportInner>,
}

impl std::fmt::Debug for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewport")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Viewport {
    /// Wraps a viewport the service has just created. It is not subscribed yet.
    pub(crate) fn new(
        session_id: SessionId,
        capacity: u64,
        initial: ViewportData,
        content_size: Arc<AtomicU64>,
        service: Arc<dyn EditService>,
        events: EventBus,
    ) -> Self {
        let snapshot = truncate_to_capacity(&session_id, capacity, initial);
        let (phase, _) = watch::channel(ViewportPhase::Unsubscribed);
        Self {
            inner: Arc::new(ViewportInner {
                id: snapshot.viewport_id.clone(),
                session_id,
                capacity,
                content_size,
                service,
                events,
                window: RwLock::new(Arc::new(snapshot)),
                phase,
                fetch_lock: tokio::sync::Mutex::new(()),
                pending: Arc::new(Notify::new()),
                notifications: Arc::new(AtomicU64::new(0)),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &ViewportId {
        &self.inner.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Offset of the window currently held.
    pub fn offset(&self) -> u64 {
        self.inner.window.read().offset
    }

    pub fn phase(&self) -> ViewportPhase {
        *self.inner.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ViewportPhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_released(&self) -> bool {
        self.phase() == ViewportPhase::Released
    }

    /// Change notifications received for this viewport so far.
    pub fn notification_count(&self) -> u64 {
        self.inner.notifications.load(Ordering::Relaxed)
    }

    /// Last applied window. Denied while a reposition or the initial fetch is in
    /// flight; use [`read`](Self::read) to wait for it instead.
    pub fn snapshot(&self) -> Result<ViewportSnapshot, ViewportError> {
        match self.phase() {
            ViewportPhase::Refreshing => Err(ViewportError::Refreshing(self.inner.id.clone())),
            ViewportPhase::Released => Err(ViewportError::Released(self.inner.id.clone())),
            ViewportPhase::Unsubscribed | ViewportPhase::Subscribed => {
                Ok(self.current_window())
            }
        }
    }

    /// Like [`snapshot`](Self::snapshot) but waits out an in-flight reposition.
    pub async fn read(&self) -> Result<ViewportSnapshot, ViewportError> {
        let mut phase = self.inner.phase.subscribe();
        let settled = *phase
            .wait_for(|phase| *phase != ViewportPhase::Refreshing)
            .await
            .map_err(|_| ViewportError::Released(self.inner.id.clone()))?;
        if settled == ViewportPhase::Released {
            return Err(ViewportError::Released(self.inner.id.clone()));
        }
        Ok(self.current_window())
    }

    fn current_window(&self) -> ViewportSnapshot {
        self.inner.window.read().as_ref().clone()
    }

    /// Opens the notification stream, performs the initial fetch and starts the
    /// refresh workers. The stream is opened first so that no change landing
    /// between the fetch and the subscription is missed.
    pub(crate) async fn subscribe(&self) -> Result<ViewportSnapshot, ViewportError> {
        let inner = &self.inner;
        let _fetch = inner.fetch_lock.lock().await;
        if !self.transition_to_refreshing() {
            return Err(ViewportError::Released(inner.id.clone()));
        }

        let stream = match inner.service.subscribe_viewport(&inner.id).await {
            Ok(stream) => stream,
            Err(source) => {
                self.release().await;
                return Err(ViewportError::Subscribe {
                    viewport_id: inner.id.clone(),
                    source,
                });
            }
        };

        let data = match self.fetch().await {
            Ok(data) => data,
            Err(source) => {
                self.release().await;
                return Err(ViewportError::Refresh {
                    viewport_id: inner.id.clone(),
                    source,
                });
            }
        };
        if self.is_released() {
            return Err(ViewportError::Released(inner.id.clone()));
        }
        let snapshot = self.apply(data);
        self.settle();

        let listener = tokio::spawn(listen(
            inner.id.clone(),
            stream,
            inner.pending.clone(),
            inner.notifications.clone(),
            inner.events.clone(),
        ));
        let refresher = tokio::spawn(refresh_on_notify(
            Arc::downgrade(&self.inner),
            inner.pending.clone(),
        ));
        inner.workers.lock().extend([listener, refresher]);
        debug!(
            target: "reef::viewport",
            viewport_id = %inner.id,
            offset = snapshot.offset,
            length = snapshot.length(),
            "viewport subscribed"
        );
        inner
            .events
            .publish(ViewportEvent::Refreshed(snapshot.clone()));
        Ok(snapshot)
    }

    /// Re-fetches the current window. Used by the notification worker and by the
    /// recovery paths after a failed mutation or a failed notify-now.
    ///
    /// On failure the last good window is kept and a `RefreshFailed` event is
    /// published; nothing retries automatically.
    pub async fn refresh(&self) -> Result<ViewportSnapshot, ViewportError> {
        let inner = &self.inner;
        self.ensure_live()?;
        let _fetch = inner.fetch_lock.lock().await;
        self.ensure_live()?;
        let fetched = self.fetch().await;
        // A response that lands after release is dropped on the floor.
        self.ensure_live()?;
        match fetched {
            Ok(data) => {
                let snapshot = self.apply(data);
                trace!(
                    target: "reef::viewport",
                    viewport_id = %inner.id,
                    length = snapshot.length(),
                    "viewport refreshed"
                );
                inner
                    .events
                    .publish(ViewportEvent::Refreshed(snapshot.clone()));
                Ok(snapshot)
            }
            Err(source) => Err(self.refresh_failed(source, |viewport_id, source| {
                ViewportError::Refresh {
                    viewport_id,
                    source,
                }
            })),
        }
    }

    /// Moves the window to `offset` and fetches it. Reads are denied until the
    /// fetch completes; on failure the previous window stays in place. An offset
    /// past the session's computed size is rejected without calling the service.
    pub async fn reposition(&self, offset: u64) -> Result<ViewportSnapshot, ViewportError> {
        let inner = &self.inner;
        self.ensure_live()?;
        let size = inner.content_size.load(Ordering::Acquire);
        if offset > size {
            return Err(ViewportError::OutOfRange { offset, size });
        }
        let _fetch = inner.fetch_lock.lock().await;
        if !self.transition_to_refreshing() {
            return Err(ViewportError::Released(inner.id.clone()));
        }
        let result = match inner
            .service
            .modify_viewport(&inner.id, offset, inner.capacity)
            .await
        {
            Ok(data) => self.clamp_to_content(data).await,
            Err(source) => Err(source),
        };
        if self.is_released() {
            return Err(ViewportError::Released(inner.id.clone()));
        }
        match result {
            Ok(data) => {
                let snapshot = self.apply(data);
                self.settle();
                debug!(
                    target: "reef::viewport",
                    viewport_id = %inner.id,
                    requested = offset,
                    offset = snapshot.offset,
                    "viewport repositioned"
                );
                inner
                    .events
                    .publish(ViewportEvent::Refreshed(snapshot.clone()));
                Ok(snapshot)
            }
            Err(source) => {
                self.settle();
                Err(self.refresh_failed(source, |viewport_id, source| {
                    ViewportError::Reposition {
                        viewport_id,
                        source,
                    }
                }))
            }
        }
    }

    /// Stops the workers, discards anything in flight and destroys the remote
    /// viewport. Releasing twice is a no-op. A failed remote destroy is logged,
    /// not returned.
    pub async fn release(&self) {
        let inner = &self.inner;
        let previous = inner.phase.send_replace(ViewportPhase::Released);
        if previous == ViewportPhase::Released {
            return;
        }
        for worker in inner.workers.lock().drain(..) {
            worker.abort();
        }
        if let Err(err) = inner.service.destroy_viewport(&inner.id).await {
            warn!(
                target: "reef::viewport",
                viewport_id = %inner.id,
                error = %err,
                "failed to destroy remote viewport"
            );
        }
        debug!(target: "reef::viewport", viewport_id = %inner.id, "viewport released");
        inner.events.publish(ViewportEvent::Released {
            viewport_id: inner.id.clone(),
        });
    }

    async fn fetch(&self) -> Result<ViewportData, ServiceError> {
        let data = self.inner.service.viewport_data(&self.inner.id).await?;
        self.clamp_to_content(data).await
    }

    /// Content can shrink underneath a window until it starts past the end. Such
    /// a window is moved back so that it ends on the last byte.
    async fn clamp_to_content(&self, data: ViewportData) -> Result<ViewportData, ServiceError> {
        let inner = &self.inner;
        if data.offset == 0 || !data.data.is_empty() || data.following_byte_count > 0 {
            return Ok(data);
        }
        let size = inner
            .service
            .counts(&inner.session_id)
            .await?
            .computed_file_size;
        if data.offset <= size {
            return Ok(data);
        }
        let offset = size.saturating_sub(inner.capacity);
        debug!(
            target: "reef::viewport",
            viewport_id = %inner.id,
            from = data.offset,
            to = offset,
            size,
            "window past end of content; clamping"
        );
        inner
            .service
            .modify_viewport(&inner.id, offset, inner.capacity)
            .await
    }

    fn ensure_live(&self) -> Result<(), ViewportError> {
        if self.is_released() {
            return Err(ViewportError::Released(self.inner.id.clone()));
        }
        Ok(())
    }

    /// Returns false if the viewport was already released.
    fn transition_to_refreshing(&self) -> bool {
        let mut live = true;
        self.inner.phase.send_if_modified(|phase| {
            if *phase == ViewportPhase::Released {
                live = false;
                return false;
            }
            *phase = ViewportPhase::Refreshing;
            true
        });
        live
    }

    fn settle(&self) {
        self.inner.phase.send_if_modified(|phase| {
            if *phase == ViewportPhase::Refreshing {
                *phase = ViewportPhase::Subscribed;
                true
            } else {
                false
            }
        });
    }

    fn apply(&self, data: ViewportData) -> ViewportSnapshot {
        let snapshot = truncate_to_capacity(&self.inner.session_id, self.inner.capacity, data);
        *self.inner.window.write() = Arc::new(snapshot.clone());
        snapshot
    }

    fn refresh_failed(
        &self,
        source: ServiceError,
        wrap: impl FnOnce(ViewportId, ServiceError) -> ViewportError,
    ) -> ViewportError {
        let viewport_id = self.inner.id.clone();
        warn!(
            target: "reef::viewport",
            viewport_id = %viewport_id,
            error = %source,
            "viewport fetch failed; keeping last window"
        );
        self.inner.events.publish(ViewportEvent::RefreshFailed {
            viewport_id: viewport_id.clone(),
            error: source.to_string(),
        });
        wrap(viewport_id, source)
    }
}

fn truncate_to_capacity(session_id: &SessionId, capacity: u64, data: ViewportData) -> ViewportSnapshot {
    let keep = (data.data.len() as u64).min(capacity) as usize;
    let dropped = (data.data.len() - keep) as u64;
    ViewportSnapshot {
        viewport_id: data.viewport_id,
        session_id: session_id.clone(),
        offset: data.offset,
        capacity,
        data: data.data.slice(..keep),
        following_byte_count: data.following_byte_count + dropped,
    }
}

async fn listen(
    viewport_id: ViewportId,
    mut stream: NotificationStream,
    pending: Arc<Notify>,
    notifications: Arc<AtomicU64>,
    events: EventBus,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(notification) if notification.viewport_id == viewport_id => {
                notifications.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "reef::viewport",
                    viewport_id = %viewport_id,
                    serial = ?notification.serial,
                    "change notification"
                );
                // At most one permit is stored, which is what collapses a burst
                // into a single follow-up fetch.
                pending.notify_one();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    target: "reef::viewport",
                    viewport_id = %viewport_id,
                    error = %err,
                    "notification stream failed"
                );
                events.publish(ViewportEvent::RefreshFailed {
                    viewport_id: viewport_id.clone(),
                    error: format!("notification stream failed: {err}"),
                });
                return;
            }
        }
    }
    debug!(target: "reef::viewport", viewport_id = %viewport_id, "notification stream ended");
}

async fn refresh_on_notify(inner: Weak<ViewportInner>, pending: Arc<Notify>) {
    loop {
        pending.notified().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let viewport = Viewport { inner };
        if viewport.is_released() {
            return;
        }
        // Failures are already logged and published by `refresh`.
        let _ = viewport.refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::MemoryEditService;

    fn data(offset: u64, bytes: &'static [u8], following: u64) -> ViewportData {
        ViewportData {
            viewport_id: ViewportId::new("vp-1"),
            offset,
            data: Bytes::from_static(bytes),
            following_byte_count: following,
        }
    }

    #[test]
    fn oversized_windows_are_truncated_to_capacity() {
        let snapshot = truncate_to_capacity(&SessionId::new("s"), 4, data(10, b"abcdefgh", 2));
        assert_eq!(snapshot.data.as_ref(), b"abcd");
        assert_eq!(snapshot.following_byte_count, 6);
        assert_eq!(snapshot.end(), 14);
    }

    #[tokio::test]
    async fn snapshot_is_denied_while_refreshing() {
        let viewport = Viewport::new(
            SessionId::new("s"),
            8,
            data(0, b"abc", 0),
            Arc::new(AtomicU64::new(3)),
            MemoryEditService::new(),
            EventBus::new(),
        );
        assert!(viewport.snapshot().is_ok());

        assert!(viewport.transition_to_refreshing());
        assert!(matches!(
            viewport.snapshot(),
            Err(ViewportError::Refreshing(_))
        ));

        viewport.settle();
        assert_eq!(viewport.snapshot().unwrap().data.as_ref(), b"abc");
        assert_eq!(viewport.phase(), ViewportPhase::Subscribed);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_blocks_further_fetches() {
        let viewport = Viewport::new(
            SessionId::new("s"),
            8,
            data(0, b"abc", 0),
            Arc::new(AtomicU64::new(3)),
            MemoryEditService::new(),
            EventBus::new(),
        );
        viewport.release().await;
        viewport.release().await;
        assert!(viewport.is_released());
        assert!(matches!(
            viewport.refresh().await,
            Err(ViewportError::Released(_))
        ));
        assert!(matches!(
            viewport.read().await,
            Err(ViewportError::Released(_))
        ));
    }
}
