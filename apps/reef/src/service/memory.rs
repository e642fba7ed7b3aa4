//! In-process [`EditService`] over local files.
//!
//! Keeps the whole file in memory with an ordered change log and an undo stack.
//! File IO is blocking; this backend is meant for tests and one-shot local runs,
//! not for multi-gigabyte files.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    Change, CreatedSession, EditService, HeartbeatResponse, NotificationStream, SaveFlags,
    SaveResponse, SaveStatus, SearchQuery, ServerInfo, ServiceError, SessionCounts, SessionId,
    ViewportData, ViewportId, ViewportNotification, find_matches,
};

/// Operation names used by the test hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceOp {
    ServerInfo,
    CreateSession,
    DestroySession,
    CreateViewport,
    ViewportData,
    ModifyViewport,
    DestroyViewport,
    SubmitChange,
    Undo,
    Redo,
    Clear,
    Counts,
    Search,
    ReplaceAll,
    Save,
    Subscribe,
    PauseEvents,
    ResumeEvents,
    NotifyChanged,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn read(path: &Path) -> Option<Self> {
        std::fs::metadata(path).ok().map(|meta| Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

struct MemorySession {
    path: PathBuf,
    base: Vec<u8>,
    changes: Vec<(u64, Change)>,
    undone: Vec<(u64, Change)>,
    opened: Option<Fingerprint>,
    paused: bool,
    touched_while_paused: BTreeSet<ViewportId>,
    viewports: BTreeSet<ViewportId>,
}

impl MemorySession {
    fn content(&self) -> Vec<u8> {
        let mut content = self.base.clone();
        for (_, change) in &self.changes {
            apply_change(&mut content, change);
        }
        content
    }

    fn counts(&self) -> SessionCounts {
        SessionCounts {
            computed_file_size: self.content().len() as u64,
            change_count: self.changes.len() as u64,
            undo_count: self.undone.len() as u64,
        }
    }
}

fn apply_change(content: &mut Vec<u8>, change: &Change) {
    let start = (change.offset as usize).min(content.len());
    let end = start.saturating_add(change.original.len()).min(content.len());
    content.splice(start..end, change.replacement.iter().copied());
}

struct MemoryViewport {
    session_id: SessionId,
    offset: u64,
    capacity: u64,
    subscribers: Vec<mpsc::UnboundedSender<ViewportNotification>>,
}

#[derive(Default)]
struct MemoryState {
    next_serial: u64,
    next_viewport: u64,
    sessions: HashMap<SessionId, MemorySession>,
    viewports: HashMap<ViewportId, MemoryViewport>,
}

impl MemoryState {
    fn session(&self, session_id: &SessionId) -> Result<&MemorySession, ServiceError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut MemorySession, ServiceError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))
    }

    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn window(&self, viewport_id: &ViewportId) -> Result<ViewportData, ServiceError> {
        let viewport = self
            .viewports
            .get(viewport_id)
            .ok_or_else(|| ServiceError::NotFound(format!("viewport {viewport_id}")))?;
        let content = self.session(&viewport.session_id)?.content();
        let start = (viewport.offset as usize).min(content.len());
        let end = start
            .saturating_add(viewport.capacity as usize)
            .min(content.len());
        Ok(ViewportData {
            viewport_id: viewport_id.clone(),
            offset: viewport.offset,
            data: Bytes::copy_from_slice(&content[start..end]),
            following_byte_count: (content.len() - end) as u64,
        })
    }

    /// Notifies viewports whose window starts before `from_offset` ends mattering:
    /// a change at `from_offset` can shift or rewrite every byte after it.
    fn touch(&mut self, session_id: &SessionId, from_offset: Option<u64>, serial: Option<u64>) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        for viewport_id in &session.viewports {
            let Some(viewport) = self.viewports.get_mut(viewport_id) else {
                continue;
            };
            if let Some(offset) = from_offset {
                if offset >= viewport.offset.saturating_add(viewport.capacity) {
                    continue;
                }
            }
            if session.paused {
                session.touched_while_paused.insert(viewport_id.clone());
                continue;
            }
            let notification = ViewportNotification {
                viewport_id: viewport_id.clone(),
                serial,
            };
            viewport
                .subscribers
                .retain(|tx| tx.send(notification.clone()).is_ok());
        }
    }
}

fn paths_match(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn sniff_content_type(bytes: &[u8]) -> Option<String> {
    const MAGIC: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"GIF8", "image/gif"),
        (b"\x7fELF", "application/x-elf"),
        (b"\xff\xd8\xff", "image/jpeg"),
    ];
    if let Some((_, mime)) = MAGIC.iter().find(|(magic, _)| bytes.starts_with(magic)) {
        return Some((*mime).to_string());
    }
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes)
        .ok()
        .map(|_| "text/plain".to_string())
}

/// In-memory adapter for tests and local wiring.
pub struct MemoryEditService {
    started: Instant,
    state: Mutex<MemoryState>,
    calls: Mutex<HashMap<ServiceOp, u64>>,
    faults: Mutex<HashMap<ServiceOp, u32>>,
    gates: Mutex<HashMap<ServiceOp, Arc<Semaphore>>>,
}

impl MemoryEditService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            state: Mutex::new(MemoryState::default()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    /// How many times `op` has been invoked since creation or the last reset.
    pub fn call_count(&self, op: ServiceOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn reset_call_counts(&self) {
        self.calls.lock().clear();
    }

    /// Makes the next invocation of `op` fail with a transport error.
    pub fn fail_next(&self, op: ServiceOp) {
        *self.faults.lock().entry(op).or_default() += 1;
    }

    /// Holds every subsequent `op` call until a permit is added to the returned
    /// semaphore or [`release_gate`](Self::release_gate) is called.
    pub fn gate(&self, op: ServiceOp) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(op, gate.clone());
        gate
    }

    pub fn release_gate(&self, op: ServiceOp) {
        if let Some(gate) = self.gates.lock().remove(&op) {
            gate.close();
        }
    }

    /// Current computed content of a session, for assertions.
    pub fn content(&self, session_id: &SessionId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(MemorySession::content)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    async fn enter(&self, op: ServiceOp) -> Result<(), ServiceError> {
        *self.calls.lock().entry(op).or_default() += 1;
        let gate = self.gates.lock().get(&op).cloned();
        if let Some(gate) = gate {
            // A closed gate lets everyone through.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ServiceError::Transport(format!(
                    "injected failure for {op:?}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EditService for MemoryEditService {
    async fn server_info(&self) -> Result<ServerInfo, ServiceError> {
        self.enter(ServiceOp::ServerInfo).await?;
        Ok(ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    async fn create_session(
        &self,
        file_path: &Path,
        checkpoint_dir: Option<&Path>,
    ) -> Result<CreatedSession, ServiceError> {
        self.enter(ServiceOp::CreateSession).await?;
        if let Some(dir) = checkpoint_dir {
            if !dir.is_dir() {
                return Err(ServiceError::Rejected(format!(
                    "checkpoint directory {} does not exist",
                    dir.display()
                )));
            }
        }
        let base = std::fs::read(file_path)?;
        let opened = Fingerprint::read(file_path);
        let content_type = sniff_content_type(&base);
        let file_size = base.len() as u64;
        let session_id = SessionId::new(Uuid::new_v4().to_string());

        self.state.lock().sessions.insert(
            session_id.clone(),
            MemorySession {
                path: file_path.to_path_buf(),
                base,
                changes: Vec::new(),
                undone: Vec::new(),
                opened,
                paused: false,
                touched_while_paused: BTreeSet::new(),
                viewports: BTreeSet::new(),
            },
        );
        debug!(
            target: "reef::service",
            session_id = %session_id,
            path = %file_path.display(),
            file_size,
            "memory session created"
        );
        Ok(CreatedSession {
            session_id,
            file_size: Some(file_size),
            content_type,
        })
    }

    async fn destroy_session(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        self.enter(ServiceOp::DestroySession).await?;
        let mut state = self.state.lock();
        let session = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
        for viewport_id in &session.viewports {
            state.viewports.remove(viewport_id);
        }
        Ok(())
    }

    async fn create_viewport(
        &self,
        session_id: &SessionId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError> {
        self.enter(ServiceOp::CreateViewport).await?;
        if capacity == 0 {
            return Err(ServiceError::Rejected("viewport capacity must be > 0".into()));
        }
        let mut state = self.state.lock();
        state.session(session_id)?;
        state.next_viewport += 1;
        let viewport_id = ViewportId::new(format!("vp-{}", state.next_viewport));
        state.viewports.insert(
            viewport_id.clone(),
            MemoryViewport {
                session_id: session_id.clone(),
                offset,
                capacity,
                subscribers: Vec::new(),
            },
        );
        state
            .session_mut(session_id)?
            .viewports
            .insert(viewport_id.clone());
        state.window(&viewport_id)
    }

    async fn viewport_data(&self, viewport_id: &ViewportId) -> Result<ViewportData, ServiceError> {
        self.enter(ServiceOp::ViewportData).await?;
        self.state.lock().window(viewport_id)
    }

    async fn modify_viewport(
        &self,
        viewport_id: &ViewportId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError> {
        self.enter(ServiceOp::ModifyViewport).await?;
        let mut state = self.state.lock();
        let viewport = state
            .viewports
            .get_mut(viewport_id)
            .ok_or_else(|| ServiceError::NotFound(format!("viewport {viewport_id}")))?;
        viewport.offset = offset;
        viewport.capacity = capacity.max(1);
        state.window(viewport_id)
    }

    async fn destroy_viewport(&self, viewport_id: &ViewportId) -> Result<(), ServiceError> {
        self.enter(ServiceOp::DestroyViewport).await?;
        let mut state = self.state.lock();
        let viewport = state
            .viewports
            .remove(viewport_id)
            .ok_or_else(|| ServiceError::NotFound(format!("viewport {viewport_id}")))?;
        if let Some(session) = state.sessions.get_mut(&viewport.session_id) {
            session.viewports.remove(viewport_id);
            session.touched_while_paused.remove(viewport_id);
        }
        Ok(())
    }

    async fn submit_change(
        &self,
        session_id: &SessionId,
        change: &Change,
    ) -> Result<u64, ServiceError> {
        self.enter(ServiceOp::SubmitChange).await?;
        let mut state = self.state.lock();
        let content = state.session(session_id)?.content();
        let start = change.offset as usize;
        let end = start.saturating_add(change.original.len());
        if start > content.len() || end > content.len() {
            return Err(ServiceError::Rejected(format!(
                "change at {} extends past end of content ({} bytes)",
                change.offset,
                content.len()
            )));
        }
        if content[start..end] != change.original[..] {
            return Err(ServiceError::Rejected(format!(
                "original bytes at {} do not match session content",
                change.offset
            )));
        }
        let serial = state.serial();
        let session = state.session_mut(session_id)?;
        session.changes.push((serial, change.clone()));
        session.undone.clear();
        state.touch(session_id, Some(change.offset), Some(serial));
        trace!(target: "reef::service", session_id = %session_id, serial, kind = ?change.kind(), "change applied");
        Ok(serial)
    }

    async fn undo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError> {
        self.enter(ServiceOp::Undo).await?;
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        let Some((serial, change)) = session.changes.pop() else {
            return Ok(None);
        };
        let offset = change.offset;
        session.undone.push((serial, change));
        state.touch(session_id, Some(offset), Some(serial));
        Ok(Some(serial))
    }

    async fn redo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError> {
        self.enter(ServiceOp::Redo).await?;
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        let Some((serial, change)) = session.undone.pop() else {
            return Ok(None);
        };
        let offset = change.offset;
        session.changes.push((serial, change));
        state.touch(session_id, Some(offset), Some(serial));
        Ok(Some(serial))
    }

    async fn clear(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        self.enter(ServiceOp::Clear).await?;
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        session.changes.clear();
        session.undone.clear();
        state.touch(session_id, None, None);
        Ok(())
    }

    async fn counts(&self, session_id: &SessionId) -> Result<SessionCounts, ServiceError> {
        self.enter(ServiceOp::Counts).await?;
        Ok(self.state.lock().session(session_id)?.counts())
    }

    async fn search(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
    ) -> Result<Vec<u64>, ServiceError> {
        self.enter(ServiceOp::Search).await?;
        let content = self.state.lock().session(session_id)?.content();
        Ok(find_matches(&content, query))
    }

    async fn replace_all(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
        replacement: &Bytes,
    ) -> Result<u64, ServiceError> {
        self.enter(ServiceOp::ReplaceAll).await?;
        let mut state = self.state.lock();
        let content = state.session(session_id)?.content();
        let matches = find_matches(&content, query);
        let pattern_len = query.pattern.len();
        let mut shift: i64 = 0;
        for found in &matches {
            let start = *found as usize;
            let original = Bytes::copy_from_slice(&content[start..start + pattern_len]);
            let change = Change::new((*found as i64 + shift) as u64, original, replacement.clone());
            shift += change.size_delta();
            let serial = state.serial();
            let offset = change.offset;
            let session = state.session_mut(session_id)?;
            session.changes.push((serial, change));
            session.undone.clear();
            state.touch(session_id, Some(offset), Some(serial));
        }
        Ok(matches.len() as u64)
    }

    async fn save(
        &self,
        session_id: &SessionId,
        path: &Path,
        flags: SaveFlags,
    ) -> Result<SaveResponse, ServiceError> {
        self.enter(ServiceOp::Save).await?;
        let (content, same_path, opened) = {
            let state = self.state.lock();
            let session = state.session(session_id)?;
            (
                session.content(),
                paths_match(&session.path, path),
                session.opened,
            )
        };

        if !flags.force {
            if same_path && Fingerprint::read(path) != opened {
                debug!(
                    target: "reef::service",
                    session_id = %session_id,
                    path = %path.display(),
                    "target modified since open"
                );
                return Ok(SaveResponse {
                    status: SaveStatus::Modified,
                    path: path.to_path_buf(),
                    file_size: None,
                });
            }
            if !flags.overwrite && path.exists() {
                return Err(ServiceError::Rejected(format!(
                    "{} exists and overwrite was not requested",
                    path.display()
                )));
            }
        }

        std::fs::write(path, &content)?;
        if same_path {
            if let Some(session) = self.state.lock().sessions.get_mut(session_id) {
                session.opened = Fingerprint::read(path);
            }
        }
        Ok(SaveResponse {
            status: SaveStatus::Success,
            path: path.to_path_buf(),
            file_size: Some(content.len() as u64),
        })
    }

    async fn subscribe_viewport(
        &self,
        viewport_id: &ViewportId,
    ) -> Result<NotificationStream, ServiceError> {
        self.enter(ServiceOp::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let viewport = state
            .viewports
            .get_mut(viewport_id)
            .ok_or_else(|| ServiceError::NotFound(format!("viewport {viewport_id}")))?;
        viewport.subscribers.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|notification| (Ok(notification), rx))
        });
        Ok(stream.boxed())
    }

    async fn pause_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        self.enter(ServiceOp::PauseEvents).await?;
        self.state.lock().session_mut(session_id)?.paused = true;
        Ok(())
    }

    async fn resume_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        self.enter(ServiceOp::ResumeEvents).await?;
        self.state.lock().session_mut(session_id)?.paused = false;
        Ok(())
    }

    async fn notify_changed_viewports(&self, session_id: &SessionId) -> Result<u64, ServiceError> {
        self.enter(ServiceOp::NotifyChanged).await?;
        let mut state = self.state.lock();
        let touched = std::mem::take(&mut state.session_mut(session_id)?.touched_while_paused);
        let mut notified = 0;
        for viewport_id in touched {
            if let Some(viewport) = state.viewports.get_mut(&viewport_id) {
                let notification = ViewportNotification {
                    viewport_id: viewport_id.clone(),
                    serial: None,
                };
                viewport
                    .subscribers
                    .retain(|tx| tx.send(notification.clone()).is_ok());
                notified += 1;
            }
        }
        Ok(notified)
    }

    async fn heartbeat(
        &self,
        session_ids: &[SessionId],
        interval_ms: u64,
    ) -> Result<HeartbeatResponse, ServiceError> {
        self.enter(ServiceOp::Heartbeat).await?;
        let state = self.state.lock();
        trace!(
            target: "reef::service",
            sessions = session_ids.len(),
            interval_ms,
            "heartbeat"
        );
        let used_memory = state
            .sessions
            .values()
            .map(|session| {
                session.base.len()
                    + session
                        .changes
                        .iter()
                        .chain(session.undone.iter())
                        .map(|(_, change)| change.original.len() + change.replacement.len())
                        .sum::<usize>()
            })
            .sum::<usize>() as u64;
        Ok(HeartbeatResponse {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            cpu_load_average: 0.0,
            used_memory,
            session_count: state.sessions.len() as u64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
