//! Search and bulk replace against a session.
//!
//! A bulk replace would otherwise produce one viewport notification per match.
//! Notifications are paused around the replace, then a single "notify now" asks
//! the service to ping every viewport it touched. If that last step fails the
//! focused viewport is refreshed directly so the visible window is never left
//! stale.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{MutationError, MutationKind, ReefError, SessionError};
use crate::service::SearchQuery;
use crate::session::{Session, SessionSnapshot};

/// How viewports were brought back in line after a replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The service accepted "notify now"; subscribed viewports refresh themselves.
    Notified,
    /// Resume or notify-now failed; the focused viewport was refreshed directly.
    FallbackRefresh { cause: String },
    /// The fallback refresh failed as well, or there was no viewport to refresh.
    Unresolved { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceReport {
    pub replaced: u64,
    pub reconciliation: Reconciliation,
    pub metadata: SessionSnapshot,
}

/// Ascending offsets of every match. No local state changes.
pub async fn search(session: &Session, query: &SearchQuery) -> Result<Vec<u64>, ReefError> {
    if session.is_closed() {
        return Err(SessionError::Closed(session.id().clone()).into());
    }
    let matches = session.service().search(session.id(), query).await?;
    debug!(
        target: "reef::search",
        session_id = %session.id(),
        pattern_len = query.pattern.len(),
        case_insensitive = query.case_insensitive,
        matches = matches.len(),
        "search complete"
    );
    Ok(matches)
}

/// Replaces every match of `query` with `replacement`.
///
/// Notifications are resumed even when the replace fails. Session metadata is
/// reloaded whatever happened to the notify step. Zero replacements is a
/// successful result.
pub async fn replace_all(
    session: &Session,
    query: &SearchQuery,
    replacement: impl Into<Bytes>,
) -> Result<ReplaceReport, MutationError> {
    let replacement = replacement.into();
    let _guard = session.begin_mutation().await?;
    let service = session.service();
    let session_id = session.id();

    if let Err(err) = service.pause_viewport_events(session_id).await {
        warn!(
            target: "reef::search",
            session_id = %session_id,
            error = %err,
            "failed to pause viewport events; replacing unsuppressed"
        );
    }

    let replaced = service.replace_all(session_id, query, &replacement).await;
    let resumed = service.resume_viewport_events(session_id).await;

    let replaced = match replaced {
        Ok(count) => count,
        Err(source) => {
            if let Err(err) = &resumed {
                warn!(
                    target: "reef::search",
                    session_id = %session_id,
                    error = %err,
                    "failed to resume viewport events"
                );
                session.mark_events_suspended();
            }
            session
                .reconcile_viewports(MutationKind::Replace, &source)
                .await;
            return Err(MutationError::Rejected {
                kind: MutationKind::Replace,
                source,
            });
        }
    };

    let notified = match resumed {
        Ok(()) => service.notify_changed_viewports(session_id).await.map(|_| ()),
        Err(err) => {
            session.mark_events_suspended();
            Err(err)
        }
    };
    let reconciliation = match notified {
        Ok(()) => Reconciliation::Notified,
        Err(cause) => {
            warn!(
                target: "reef::search",
                session_id = %session_id,
                error = %cause,
                "viewport notification after replace failed; refreshing focused viewport"
            );
            match session.focused() {
                Some(viewport) => match viewport.refresh().await {
                    Ok(_) => Reconciliation::FallbackRefresh {
                        cause: cause.to_string(),
                    },
                    Err(err) => {
                        warn!(
                            target: "reef::search",
                            session_id = %session_id,
                            viewport_id = %viewport.id(),
                            error = %err,
                            "fallback refresh failed"
                        );
                        Reconciliation::Unresolved {
                            cause: format!("{cause}; fallback refresh failed: {err}"),
                        }
                    }
                },
                None => Reconciliation::Unresolved {
                    cause: format!("{cause}; no viewport to refresh"),
                },
            }
        }
    };

    let metadata = session
        .reload_metadata()
        .await
        .map_err(MutationError::Metadata)?;
    info!(
        target: "reef::search",
        session_id = %session_id,
        replaced,
        reconciliation = ?reconciliation,
        "replace complete"
    );
    Ok(ReplaceReport {
        replaced,
        reconciliation,
        metadata,
    })
}
