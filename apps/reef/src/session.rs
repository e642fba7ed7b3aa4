//! One open remote editing context and its derived metadata.
//!
//! Mutating calls (edit, undo, redo, clear, replace, save) are serialized per
//! session through a single async lock; each reads counts that the next one
//! would invalidate. Viewport refreshes and snapshots do not take that lock.
//!
//! If viewport events could not be resumed after a replace, the session stays
//! marked as suspended: every later mutation first retries the resume and, while
//! it keeps failing, refreshes the live viewports itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::error::{MutationError, MutationKind, SessionError, ViewportError};
use crate::events::{EventBus, SessionEvent};
use crate::service::{Change, EditService, ServiceError, SessionCounts, SessionId, ViewportId};
use crate::viewport::Viewport;

/// Reported when the service does not name a content type.
pub const UNKNOWN_CONTENT_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub file_path: PathBuf,
    pub file_name: String,
    pub disk_file_size: u64,
    pub computed_file_size: u64,
    pub content_type: String,
    pub change_count: u64,
    pub undo_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Metadata {
    disk_file_size: u64,
    counts: SessionCounts,
}

pub(crate) type MutationGuard<'a> = MutexGuard<'a, ()>;

pub struct Session {
    id: SessionId,
    file_path: PathBuf,
    content_type: String,
    service: Arc<dyn EditService>,
    events: EventBus,
    metadata: RwLock<Metadata>,
    /// Last known computed size, shared with every viewport for bounds checks.
    content_size: Arc<AtomicU64>,
    viewports: Mutex<Vec<Viewport>>,
    focus: Mutex<Option<ViewportId>>,
    mutation: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    events_suspended: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("file_path", &self.file_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates the remote session and loads its first metadata snapshot. On any
    /// failure nothing is retained: a half-created remote session is destroyed.
    pub(crate) async fn open(
        service: Arc<dyn EditService>,
        events: EventBus,
        file_path: &Path,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Arc<Self>, SessionError> {
        validate_path(file_path)?;
        let created = service
            .create_session(file_path, checkpoint_dir)
            .await
            .map_err(|source| SessionError::Create {
                path: file_path.to_path_buf(),
                source,
            })?;

        let counts = match service.counts(&created.session_id).await {
            Ok(counts) => counts,
            Err(source) => {
                if let Err(err) = service.destroy_session(&created.session_id).await {
                    warn!(
                        target: "reef::session",
                        session_id = %created.session_id,
                        error = %err,
                        "failed to destroy half-open session"
                    );
                }
                return Err(SessionError::Counts {
                    session_id: created.session_id,
                    source,
                });
            }
        };

        let session = Arc::new(Self {
            id: created.session_id,
            file_path: file_path.to_path_buf(),
            content_type: created
                .content_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_CONTENT_TYPE.to_string()),
            service,
            events,
            metadata: RwLock::new(Metadata {
                disk_file_size: created.file_size.unwrap_or(counts.computed_file_size),
                counts,
            }),
            content_size: Arc::new(AtomicU64::new(counts.computed_file_size)),
            viewports: Mutex::new(Vec::new()),
            focus: Mutex::new(None),
            mutation: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            events_suspended: AtomicBool::new(false),
        });
        info!(
            target: "reef::session",
            session_id = %session.id,
            path = %session.file_path.display(),
            disk_file_size = session.metadata.read().disk_file_size,
            content_type = %session.content_type,
            "session opened"
        );
        session
            .events
            .publish(SessionEvent::MetadataChanged(session.snapshot()));
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn counts(&self) -> SessionCounts {
        self.metadata.read().counts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn service(&self) -> &Arc<dyn EditService> {
        &self.service
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let metadata = *self.metadata.read();
        SessionSnapshot {
            session_id: self.id.clone(),
            file_path: self.file_path.clone(),
            file_name: self
                .file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.file_path.display().to_string()),
            disk_file_size: metadata.disk_file_size,
            computed_file_size: metadata.counts.computed_file_size,
            content_type: self.content_type.clone(),
            change_count: metadata.counts.change_count,
            undo_count: metadata.counts.undo_count,
        }
    }

    /// Creates a viewport, fetches its window and subscribes it to change
    /// notifications. The new viewport takes focus. `offset` may equal the
    /// computed size (an empty window at the end) but not exceed it.
    pub async fn create_viewport(
        &self,
        offset: u64,
        capacity: u64,
    ) -> Result<Viewport, ViewportError> {
        if self.is_closed() {
            return Err(ViewportError::SessionClosed(self.id.clone()));
        }
        let size = self.content_size.load(Ordering::Acquire);
        if offset > size {
            return Err(ViewportError::OutOfRange { offset, size });
        }
        let initial = self
            .service
            .create_viewport(&self.id, offset, capacity)
            .await
            .map_err(ViewportError::Create)?;
        let viewport = Viewport::new(
            self.id.clone(),
            capacity,
            initial,
            self.content_size.clone(),
            self.service.clone(),
            self.events.clone(),
        );
        viewport.subscribe().await?;

        {
            let mut viewports = self.viewports.lock();
            if !self.is_closed() {
                viewports.push(viewport.clone());
                *self.focus.lock() = Some(viewport.id().clone());
                debug!(
                    target: "reef::session",
                    session_id = %self.id,
                    viewport_id = %viewport.id(),
                    offset,
                    capacity,
                    "viewport created"
                );
                return Ok(viewport);
            }
        }
        // Closed while the viewport was being set up.
        viewport.release().await;
        Err(ViewportError::SessionClosed(self.id.clone()))
    }

    /// Live viewports, oldest first.
    pub fn viewports(&self) -> Vec<Viewport> {
        let mut viewports = self.viewports.lock();
        viewports.retain(|viewport| !viewport.is_released());
        viewports.clone()
    }

    pub fn viewport(&self, viewport_id: &ViewportId) -> Option<Viewport> {
        self.viewports()
            .into_iter()
            .find(|viewport| viewport.id() == viewport_id)
    }

    /// Moves focus to `viewport_id`. Returns false if no such live viewport exists.
    pub fn focus(&self, viewport_id: &ViewportId) -> bool {
        if self.viewport(viewport_id).is_none() {
            return false;
        }
        *self.focus.lock() = Some(viewport_id.clone());
        true
    }

    /// The focused viewport, falling back to the most recently created live one.
    pub fn focused(&self) -> Option<Viewport> {
        let viewports = self.viewports();
        let focus = self.focus.lock().clone();
        focus
            .and_then(|id| viewports.iter().find(|viewport| viewport.id() == &id).cloned())
            .or_else(|| viewports.last().cloned())
    }

    pub async fn release_viewport(&self, viewport_id: &ViewportId) {
        let removed = {
            let mut viewports = self.viewports.lock();
            viewports
                .iter()
                .position(|viewport| viewport.id() == viewport_id)
                .map(|index| viewports.remove(index))
        };
        if let Some(viewport) = removed {
            viewport.release().await;
        }
    }

    /// Submits one change transaction replacing `original` at `offset` with
    /// `replacement`. Returns the change serial.
    pub async fn edit(
        &self,
        offset: u64,
        original: impl Into<Bytes>,
        replacement: impl Into<Bytes>,
    ) -> Result<u64, MutationError> {
        let change = Change::new(offset, original, replacement);
        let _guard = self.begin_mutation().await?;
        let result = self.service.submit_change(&self.id, &change).await;
        self.finish_mutation(MutationKind::Edit, result).await
    }

    /// Serial of the undone change, or `None` when there was nothing to undo.
    pub async fn undo(&self) -> Result<Option<u64>, MutationError> {
        let _guard = self.begin_mutation().await?;
        let result = self.service.undo(&self.id).await;
        self.finish_mutation(MutationKind::Undo, result).await
    }

    pub async fn redo(&self) -> Result<Option<u64>, MutationError> {
        let _guard = self.begin_mutation().await?;
        let result = self.service.redo(&self.id).await;
        self.finish_mutation(MutationKind::Redo, result).await
    }

    pub async fn clear(&self) -> Result<(), MutationError> {
        let _guard = self.begin_mutation().await?;
        let result = self.service.clear(&self.id).await;
        self.finish_mutation(MutationKind::Clear, result).await
    }

    /// Re-queries computed size and change/undo counts as one snapshot. Waits for
    /// any in-flight mutation first.
    pub async fn refresh_metadata(&self) -> Result<SessionSnapshot, SessionError> {
        let _guard = self.mutation.lock().await;
        self.reload_metadata().await
    }

    pub(crate) async fn begin_mutation(&self) -> Result<MutationGuard<'_>, MutationError> {
        if self.is_closed() {
            return Err(MutationError::Closed(self.id.clone()));
        }
        let guard = self.mutation.lock().await;
        if self.is_closed() {
            return Err(MutationError::Closed(self.id.clone()));
        }
        self.restore_events().await;
        Ok(guard)
    }

    pub fn events_suspended(&self) -> bool {
        self.events_suspended.load(Ordering::Acquire)
    }

    /// Called when a resume failed and the service may still hold events back.
    pub(crate) fn mark_events_suspended(&self) {
        if !self.events_suspended.swap(true, Ordering::AcqRel) {
            warn!(
                target: "reef::session",
                session_id = %self.id,
                "viewport events left suspended; refreshing viewports after each mutation"
            );
        }
    }

    /// Retries a resume that failed earlier. Viewports touched while events were
    /// held back are notified once it succeeds. Caller must hold the mutation guard.
    async fn restore_events(&self) {
        if !self.events_suspended() {
            return;
        }
        if let Err(err) = self.service.resume_viewport_events(&self.id).await {
            warn!(
                target: "reef::session",
                session_id = %self.id,
                error = %err,
                "resume of viewport events failed again"
            );
            return;
        }
        self.events_suspended.store(false, Ordering::Release);
        info!(target: "reef::session", session_id = %self.id, "viewport events resumed");
        if let Err(err) = self.service.notify_changed_viewports(&self.id).await {
            warn!(
                target: "reef::session",
                session_id = %self.id,
                error = %err,
                "notify after late resume failed; refreshing viewports"
            );
            self.refresh_viewports().await;
        }
    }

    async fn finish_mutation<T>(
        &self,
        kind: MutationKind,
        result: Result<T, ServiceError>,
    ) -> Result<T, MutationError> {
        match result {
            Ok(value) => {
                if self.events_suspended() {
                    // No notification will reach the viewports for this change.
                    self.refresh_viewports().await;
                }
                self.reload_metadata()
                    .await
                    .map_err(MutationError::Metadata)?;
                Ok(value)
            }
            Err(source) => {
                self.reconcile_viewports(kind, &source).await;
                Err(MutationError::Rejected { kind, source })
            }
        }
    }

    /// Caller must hold the mutation guard.
    pub(crate) async fn reload_metadata(&self) -> Result<SessionSnapshot, SessionError> {
        let counts = self
            .service
            .counts(&self.id)
            .await
            .map_err(|source| SessionError::Counts {
                session_id: self.id.clone(),
                source,
            })?;
        self.metadata.write().counts = counts;
        self.content_size
            .store(counts.computed_file_size, Ordering::Release);
        let snapshot = self.snapshot();
        self.events
            .publish(SessionEvent::MetadataChanged(snapshot.clone()));
        Ok(snapshot)
    }

    pub(crate) fn set_disk_file_size(&self, size: u64) {
        self.metadata.write().disk_file_size = size;
    }

    /// The service may have applied part of a failed mutation, so every live
    /// viewport is re-fetched explicitly.
    pub(crate) async fn reconcile_viewports(&self, kind: MutationKind, cause: &ServiceError) {
        let viewports = self.viewports();
        warn!(
            target: "reef::session",
            session_id = %self.id,
            op = %kind,
            error = %cause,
            viewports = viewports.len(),
            "mutation failed; refreshing viewports"
        );
        self.refresh_viewports().await;
    }

    async fn refresh_viewports(&self) {
        let viewports = self.viewports();
        let results = join_all(viewports.iter().map(Viewport::refresh)).await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(
                target: "reef::session",
                session_id = %self.id,
                failed,
                "viewport refresh incomplete"
            );
        }
    }

    /// Releases every viewport, then destroys the remote session. Closing twice is
    /// a no-op. A failed remote destroy is returned but the session stays closed.
    pub(crate) async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let viewports: Vec<Viewport> = std::mem::take(&mut *self.viewports.lock());
        join_all(viewports.iter().map(Viewport::release)).await;
        *self.focus.lock() = None;

        let result = self
            .service
            .destroy_session(&self.id)
            .await
            .map_err(|source| SessionError::Destroy {
                session_id: self.id.clone(),
                source,
            });
        info!(target: "reef::session", session_id = %self.id, "session closed");
        self.events.publish(SessionEvent::Closed {
            session_id: self.id.clone(),
        });
        result
    }
}

fn validate_path(path: &Path) -> Result<(), SessionError> {
    let invalid = |reason: &str| SessionError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if path.as_os_str().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.is_dir() {
        return Err(invalid("path is a directory"));
    }
    Ok(())
}
