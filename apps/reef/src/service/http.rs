use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::Url;

use super::wire::{
    CreateSessionRequest, HeartbeatRequest, NotifyResponse, ReplaceRequest, ReplaceResponse,
    SaveRequest, SearchResponse, SerialResponse, ViewportRequest,
};
use super::{
    Change, CreatedSession, EditService, HeartbeatResponse, NotificationStream, SaveFlags,
    SaveResponse, SearchQuery, ServerInfo, ServiceError, SessionCounts, SessionId, ViewportData,
    ViewportId, ViewportNotification,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Name of the server-sent event carrying a [`ViewportNotification`].
pub const VIEWPORT_EVENT: &str = "viewport";

/// JSON-over-HTTP client for a remote editing service.
///
/// Only the connect phase is bounded; requests themselves rely on the transport
/// to report failure.
#[derive(Debug, Clone)]
pub struct HttpEditService {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpEditService {
    pub fn new(host: &str, port: u16) -> Result<Self, ServiceError> {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let base_url = Url::parse(&format!("http://{host}:{port}/"))
            .map_err(|err| ServiceError::InvalidEndpoint(format!("{host}:{port}: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|err| ServiceError::InvalidEndpoint(format!("{path}: {err}")))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), ServiceError> {
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn post_session_op<T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        op: &str,
    ) -> Result<T, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/{op}"))?;
        self.send_json(self.client.post(url)).await
    }
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ServiceError::NotFound(body));
    }
    Err(ServiceError::Status { status, body })
}

fn event_source_error(err: EventSourceError) -> ServiceError {
    match err {
        EventSourceError::InvalidStatusCode(status, _) if status == StatusCode::NOT_FOUND => {
            ServiceError::NotFound("viewport event stream".into())
        }
        EventSourceError::InvalidStatusCode(status, _) => ServiceError::Status {
            status,
            body: String::new(),
        },
        other => ServiceError::Transport(other.to_string()),
    }
}

#[async_trait]
impl EditService for HttpEditService {
    async fn server_info(&self) -> Result<ServerInfo, ServiceError> {
        let url = self.endpoint("info")?;
        self.send_json(self.client.get(url)).await
    }

    async fn create_session(
        &self,
        file_path: &Path,
        checkpoint_dir: Option<&Path>,
    ) -> Result<CreatedSession, ServiceError> {
        let url = self.endpoint("sessions")?;
        let request = CreateSessionRequest {
            file_path: file_path.to_path_buf(),
            checkpoint_dir: checkpoint_dir.map(Path::to_path_buf),
        };
        let created: CreatedSession = self.send_json(self.client.post(url).json(&request)).await?;
        debug!(
            target: "reef::service",
            session_id = %created.session_id,
            path = %file_path.display(),
            "remote session created"
        );
        Ok(created)
    }

    async fn destroy_session(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}"))?;
        self.send_empty(self.client.delete(url)).await
    }

    async fn create_viewport(
        &self,
        session_id: &SessionId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/viewports"))?;
        let request = ViewportRequest { offset, capacity };
        self.send_json(self.client.post(url).json(&request)).await
    }

    async fn viewport_data(&self, viewport_id: &ViewportId) -> Result<ViewportData, ServiceError> {
        let url = self.endpoint(&format!("viewports/{viewport_id}"))?;
        self.send_json(self.client.get(url)).await
    }

    async fn modify_viewport(
        &self,
        viewport_id: &ViewportId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError> {
        let url = self.endpoint(&format!("viewports/{viewport_id}"))?;
        let request = ViewportRequest { offset, capacity };
        self.send_json(self.client.put(url).json(&request)).await
    }

    async fn destroy_viewport(&self, viewport_id: &ViewportId) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("viewports/{viewport_id}"))?;
        self.send_empty(self.client.delete(url)).await
    }

    async fn submit_change(
        &self,
        session_id: &SessionId,
        change: &Change,
    ) -> Result<u64, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/changes"))?;
        let response: SerialResponse = self.send_json(self.client.post(url).json(change)).await?;
        response
            .serial
            .ok_or_else(|| ServiceError::InvalidResponse("change accepted without serial".into()))
    }

    async fn undo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError> {
        let response: SerialResponse = self.post_session_op(session_id, "undo").await?;
        Ok(response.serial)
    }

    async fn redo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError> {
        let response: SerialResponse = self.post_session_op(session_id, "redo").await?;
        Ok(response.serial)
    }

    async fn clear(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/clear"))?;
        self.send_empty(self.client.post(url)).await
    }

    async fn counts(&self, session_id: &SessionId) -> Result<SessionCounts, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/counts"))?;
        self.send_json(self.client.get(url)).await
    }

    async fn search(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
    ) -> Result<Vec<u64>, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/search"))?;
        let response: SearchResponse = self.send_json(self.client.post(url).json(query)).await?;
        Ok(response.matches)
    }

    async fn replace_all(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
        replacement: &Bytes,
    ) -> Result<u64, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/replace"))?;
        let request = ReplaceRequest {
            query: query.clone(),
            replacement: replacement.clone(),
        };
        let response: ReplaceResponse =
            self.send_json(self.client.post(url).json(&request)).await?;
        Ok(response.replaced)
    }

    async fn save(
        &self,
        session_id: &SessionId,
        path: &Path,
        flags: SaveFlags,
    ) -> Result<SaveResponse, ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/save"))?;
        let request = SaveRequest {
            path: PathBuf::from(path),
            overwrite: flags.overwrite,
            force: flags.force,
        };
        self.send_json(self.client.post(url).json(&request)).await
    }

    async fn subscribe_viewport(
        &self,
        viewport_id: &ViewportId,
    ) -> Result<NotificationStream, ServiceError> {
        let url = self.endpoint(&format!("viewports/{viewport_id}/events"))?;
        let mut source = EventSource::new(self.client.get(url))
            .map_err(|err| ServiceError::Transport(err.to_string()))?;

        // Wait for the stream to open so that changes made after this call returns
        // are guaranteed to be delivered.
        match source.next().await {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                source.close();
                return Err(event_source_error(err));
            }
            None => {
                return Err(ServiceError::Transport(
                    "event stream closed before opening".into(),
                ));
            }
        }
        trace!(target: "reef::service", viewport_id = %viewport_id, "event stream open");

        let stream = futures::stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        if message.event != VIEWPORT_EVENT {
                            continue;
                        }
                        let item = serde_json::from_str::<ViewportNotification>(&message.data)
                            .map_err(|err| {
                                ServiceError::InvalidResponse(format!(
                                    "malformed viewport event: {err}"
                                ))
                            });
                        return Some((item, Some(source)));
                    }
                    Some(Err(EventSourceError::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(err)) => {
                        // No silent reconnect: the failure ends the stream.
                        source.close();
                        warn!(target: "reef::service", error = %err, "viewport event stream failed");
                        return Some((Err(event_source_error(err)), None));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn pause_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/events/pause"))?;
        self.send_empty(self.client.post(url)).await
    }

    async fn resume_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("sessions/{session_id}/events/resume"))?;
        self.send_empty(self.client.post(url)).await
    }

    async fn notify_changed_viewports(&self, session_id: &SessionId) -> Result<u64, ServiceError> {
        let response: NotifyResponse = self.post_session_op(session_id, "events/notify").await?;
        Ok(response.notified)
    }

    async fn heartbeat(
        &self,
        session_ids: &[SessionId],
        interval_ms: u64,
    ) -> Result<HeartbeatResponse, ServiceError> {
        let url = self.endpoint("heartbeat")?;
        let request = HeartbeatRequest {
            session_ids: session_ids.to_vec(),
            interval_ms,
        };
        self.send_json(self.client.post(url).json(&request)).await
    }
}
