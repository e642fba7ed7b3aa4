use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::service::{ServiceError, SessionId, ViewportId};

/// The remote service could not be reached or stopped answering.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("service at {host}:{port} did not answer after {attempts} attempts: {source}")]
    Unreachable {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: ServiceError,
    },
    #[error("heartbeat probe failed: {0}")]
    Heartbeat(#[source] ServiceError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid file path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
    #[error("failed to create session for {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: ServiceError,
    },
    #[error("failed to destroy session {session_id}: {source}")]
    Destroy {
        session_id: SessionId,
        #[source]
        source: ServiceError,
    },
    #[error("failed to query counts for session {session_id}: {source}")]
    Counts {
        session_id: SessionId,
        #[source]
        source: ServiceError,
    },
    #[error("session {0} is closed")]
    Closed(SessionId),
}

#[derive(Debug, Error)]
pub enum ViewportError {
    #[error("failed to create viewport: {0}")]
    Create(#[source] ServiceError),
    #[error("failed to reposition viewport {viewport_id}: {source}")]
    Reposition {
        viewport_id: ViewportId,
        #[source]
        source: ServiceError,
    },
    #[error("failed to refresh viewport {viewport_id}: {source}")]
    Refresh {
        viewport_id: ViewportId,
        #[source]
        source: ServiceError,
    },
    #[error("failed to subscribe viewport {viewport_id}: {source}")]
    Subscribe {
        viewport_id: ViewportId,
        #[source]
        source: ServiceError,
    },
    #[error("offset {offset} is past the end of the content ({size} bytes)")]
    OutOfRange { offset: u64, size: u64 },
    #[error("viewport {0} is refreshing")]
    Refreshing(ViewportId),
    #[error("viewport {0} has been released")]
    Released(ViewportId),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Edit,
    Undo,
    Redo,
    Clear,
    Replace,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Edit => "edit",
            MutationKind::Undo => "undo",
            MutationKind::Redo => "redo",
            MutationKind::Clear => "clear",
            MutationKind::Replace => "replace",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("{kind} rejected: {source}")]
    Rejected {
        kind: MutationKind,
        #[source]
        source: ServiceError,
    },
    /// The mutation went through but the follow-up metadata query did not.
    #[error("metadata refresh failed after mutation: {0}")]
    Metadata(#[source] SessionError),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("save to {path} failed: {source}")]
    Failed {
        path: PathBuf,
        #[source]
        source: ServiceError,
    },
    #[error("metadata refresh failed after save: {0}")]
    Metadata(#[source] SessionError),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Crate-wide error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum ReefError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Viewport(#[from] ViewportError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Save(#[from] SaveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_errors_name_the_operation() {
        let err = MutationError::Rejected {
            kind: MutationKind::Undo,
            source: ServiceError::Transport("reset".into()),
        };
        assert_eq!(err.to_string(), "undo rejected: transport error: reset");
    }

    #[test]
    fn layer_errors_convert_into_reef_error() {
        let err: ReefError = ViewportError::Released(ViewportId::new("vp-1")).into();
        assert!(matches!(err, ReefError::Viewport(ViewportError::Released(_))));
        assert_eq!(err.to_string(), "viewport vp-1 has been released");
    }
}
