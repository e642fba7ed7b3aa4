//! Process-wide set of open sessions and the heartbeat cadence derived from it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::SessionError;
use crate::events::{EventBus, RegistryEvent};
use crate::heartbeat::{ActiveIds, HeartbeatMonitor};
use crate::service::SessionId;
use crate::session::Session;

type SessionMap = Arc<RwLock<BTreeMap<SessionId, Arc<Session>>>>;

pub struct SessionRegistry {
    connection: Connection,
    events: EventBus,
    heartbeat: HeartbeatMonitor,
    sessions: SessionMap,
    /// Held across "mutate the set, then reschedule the heartbeat" so the two
    /// change as one unit.
    membership: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(connection: Connection, events: EventBus, base_interval: Duration) -> Self {
        let heartbeat =
            HeartbeatMonitor::new(connection.service().clone(), events.clone(), base_interval);
        Self {
            connection,
            events,
            heartbeat,
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            membership: Mutex::new(()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Opens a session on `file_path` and reschedules the heartbeat for the new
    /// session count. Failures are returned as-is; nothing is retried.
    pub async fn open(
        &self,
        file_path: &Path,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::open(
            self.connection.service().clone(),
            self.events.clone(),
            file_path,
            checkpoint_dir,
        )
        .await?;

        let active = {
            let _membership = self.membership.lock();
            let active = {
                let mut sessions = self.sessions.write();
                sessions.insert(session.id().clone(), session.clone());
                sessions.len()
            };
            self.heartbeat.start(self.id_source());
            active
        };
        info!(
            target: "reef::registry",
            session_id = %session.id(),
            active,
            "session registered"
        );
        self.events.publish(RegistryEvent::Opened {
            session_id: session.id().clone(),
            active,
        });
        Ok(session)
    }

    /// Deregisters and closes `session_id`. Closing an id that is not open is a
    /// no-op. The last close stops the heartbeat.
    pub async fn close(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let (session, active) = {
            let _membership = self.membership.lock();
            let (removed, active) = {
                let mut sessions = self.sessions.write();
                (sessions.remove(session_id), sessions.len())
            };
            let Some(session) = removed else {
                debug!(target: "reef::registry", session_id = %session_id, "close of unknown session ignored");
                return Ok(());
            };
            if active == 0 {
                self.heartbeat.stop();
            } else {
                self.heartbeat.start(self.id_source());
            }
            (session, active)
        };

        let result = session.close().await;
        info!(
            target: "reef::registry",
            session_id = %session_id,
            active,
            "session deregistered"
        );
        self.events.publish(RegistryEvent::Closed {
            session_id: session_id.clone(),
            active,
        });
        if active == 0 {
            self.events.publish(RegistryEvent::Idle);
        }
        result
    }

    /// Closes every open session. Returns the first failure, after trying all.
    pub async fn close_all(&self) -> Result<(), SessionError> {
        let mut first_error = None;
        for session_id in self.active_ids() {
            if let Err(err) = self.close(&session_id).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn id_source(&self) -> ActiveIds {
        let sessions = self.sessions.clone();
        Arc::new(move || sessions.read().keys().cloned().collect())
    }
}
