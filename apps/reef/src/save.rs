//! Persisting a session with optimistic conflict detection.
//!
//! ```text
//! Requested → Checking → Clean ──────────────┐
//!                     └→ Modified → (prompt) ┼→ Saved
//!                                   └────────┼→ Cancelled
//!              any failed save call ─────────┴→ Failed
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, trace, warn};

use crate::error::SaveError;
use crate::service::{SaveFlags, SaveResponse, SaveStatus, ServiceError, SessionId};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Requested,
    Checking,
    Modified,
    Clean,
    Saved,
    Cancelled,
    Failed,
}

/// Asked when the target changed on disk after the session was opened. The core
/// never decides this on its own.
#[async_trait]
pub trait OverwritePrompt: Send + Sync {
    async fn confirm_overwrite(&self, path: &Path) -> bool;
}

/// Answers every prompt with the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl OverwritePrompt for FixedAnswer {
    async fn confirm_overwrite(&self, _path: &Path) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved {
        path: PathBuf,
        file_size: Option<u64>,
        /// The target had been modified and the caller chose to overwrite it.
        forced: bool,
    },
    /// The target had been modified and the caller declined; nothing was written.
    Cancelled { path: PathBuf },
}

impl SaveOutcome {
    pub fn state(&self) -> SaveState {
        match self {
            SaveOutcome::Saved { .. } => SaveState::Saved,
            SaveOutcome::Cancelled { .. } => SaveState::Cancelled,
        }
    }
}

struct SaveMachine<'a> {
    session_id: &'a SessionId,
    path: &'a Path,
    state: SaveState,
}

impl<'a> SaveMachine<'a> {
    fn new(session_id: &'a SessionId, path: &'a Path) -> Self {
        trace!(target: "reef::save", session_id = %session_id, path = %path.display(), state = ?SaveState::Requested, "save state");
        Self {
            session_id,
            path,
            state: SaveState::Requested,
        }
    }

    fn advance(&mut self, next: SaveState) {
        trace!(
            target: "reef::save",
            session_id = %self.session_id,
            path = %self.path.display(),
            from = ?self.state,
            to = ?next,
            "save state"
        );
        self.state = next;
    }

    fn fail(&mut self, source: ServiceError) -> SaveError {
        self.advance(SaveState::Failed);
        warn!(
            target: "reef::save",
            session_id = %self.session_id,
            path = %self.path.display(),
            error = %source,
            "save failed"
        );
        SaveError::Failed {
            path: self.path.to_path_buf(),
            source,
        }
    }
}

/// Saves over the session's own file.
pub async fn save(session: &Session, prompt: &dyn OverwritePrompt) -> Result<SaveOutcome, SaveError> {
    let path = session.file_path().to_path_buf();
    save_as(session, &path, true, prompt).await
}

/// Saves to `path`. When the service reports the target as modified since the
/// session was opened, `prompt` decides between a forced overwrite and
/// cancelling. Failures are terminal for this call; nothing is retried.
pub async fn save_as(
    session: &Session,
    path: &Path,
    overwrite: bool,
    prompt: &dyn OverwritePrompt,
) -> Result<SaveOutcome, SaveError> {
    let session_id = session.id();
    let closed = || SaveError::Closed(session_id.clone());
    let mut machine = SaveMachine::new(session_id, path);
    // Hold off concurrent mutations until the file is written or abandoned.
    let _guard = session.begin_mutation().await.map_err(|_| closed())?;
    let service = session.service();

    machine.advance(SaveState::Checking);
    let flags = SaveFlags {
        overwrite,
        force: false,
    };
    let response = match service.save(session_id, path, flags).await {
        Ok(response) => response,
        Err(source) => return Err(machine.fail(source)),
    };

    let (response, forced) = match response.status {
        SaveStatus::Success => {
            machine.advance(SaveState::Clean);
            (response, false)
        }
        SaveStatus::Modified => {
            machine.advance(SaveState::Modified);
            info!(
                target: "reef::save",
                session_id = %session_id,
                path = %path.display(),
                "target modified since open; asking before overwrite"
            );
            if !prompt.confirm_overwrite(path).await {
                machine.advance(SaveState::Cancelled);
                return Ok(SaveOutcome::Cancelled {
                    path: path.to_path_buf(),
                });
            }
            let flags = SaveFlags {
                overwrite,
                force: true,
            };
            match service.save(session_id, path, flags).await {
                Ok(SaveResponse {
                    status: SaveStatus::Modified,
                    ..
                }) => {
                    return Err(machine.fail(ServiceError::InvalidResponse(
                        "forced save still reported the target as modified".into(),
                    )));
                }
                Ok(response) => (response, true),
                Err(source) => return Err(machine.fail(source)),
            }
        }
    };
    machine.advance(SaveState::Saved);

    if same_file(path, session.file_path()).await {
        // The written file is the new baseline for modified-since-open checks.
        let size = response
            .file_size
            .unwrap_or_else(|| session.counts().computed_file_size);
        session.set_disk_file_size(size);
        session
            .reload_metadata()
            .await
            .map_err(SaveError::Metadata)?;
    }
    info!(
        target: "reef::save",
        session_id = %session_id,
        path = %response.path.display(),
        forced,
        "session saved"
    );
    Ok(SaveOutcome::Saved {
        path: path.to_path_buf(),
        file_size: response.file_size,
        forced,
    })
}

/// Two spellings of one path (`dir/./x`, symlinks) name the same file.
async fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
