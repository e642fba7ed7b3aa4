//! Client-side contract of the remote editing service.
//!
//! The core never talks to the wire directly; it goes through [`EditService`]. Two
//! backends ship with the crate: [`http::HttpEditService`] for a real service and
//! [`memory::MemoryEditService`] for tests and one-shot local runs.

pub mod http;
pub mod memory;
pub mod wire;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(SessionId);
string_id!(ViewportId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: SessionId,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One window of bytes as served by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportData {
    pub viewport_id: ViewportId,
    pub offset: u64,
    #[serde(with = "b64")]
    pub data: Bytes,
    /// Bytes of content that lie beyond the end of this window.
    pub following_byte_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Overwrite,
    Replace,
}

/// A single change transaction: `original` is replaced by `replacement` at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub offset: u64,
    #[serde(with = "b64")]
    pub original: Bytes,
    #[serde(with = "b64")]
    pub replacement: Bytes,
}

impl Change {
    pub fn new(offset: u64, original: impl Into<Bytes>, replacement: impl Into<Bytes>) -> Self {
        Self {
            offset,
            original: original.into(),
            replacement: replacement.into(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match (self.original.is_empty(), self.replacement.is_empty()) {
            (true, _) => ChangeKind::Insert,
            (false, true) => ChangeKind::Delete,
            _ if self.original.len() == self.replacement.len() => ChangeKind::Overwrite,
            _ => ChangeKind::Replace,
        }
    }

    /// Net effect on content length.
    pub fn size_delta(&self) -> i64 {
        self.replacement.len() as i64 - self.original.len() as i64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub computed_file_size: u64,
    pub change_count: u64,
    pub undo_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(with = "b64")]
    pub pattern: Bytes,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub start_offset: u64,
    /// Zero searches to the end of content.
    #[serde(default)]
    pub search_length: u64,
    /// Zero means unlimited.
    #[serde(default)]
    pub limit: u64,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<Bytes>) -> Self {
        Self {
            pattern: pattern.into(),
            case_insensitive: false,
            start_offset: 0,
            search_length: 0,
            limit: 0,
        }
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn within(mut self, start_offset: u64, search_length: u64) -> Self {
        self.start_offset = start_offset;
        self.search_length = search_length;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFlags {
    pub overwrite: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Success,
    /// The target changed on disk after the session was opened; nothing was written.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub status: SaveStatus,
    pub path: PathBuf,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Server push telling a viewport its window may have changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportNotification {
    pub viewport_id: ViewportId,
    #[serde(default)]
    pub serial: Option<u64>,
}

pub type NotificationStream = BoxStream<'static, Result<ViewportNotification, ServiceError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub uptime_ms: u64,
    pub cpu_load_average: f64,
    pub used_memory: u64,
    pub session_count: u64,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid service endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service rejected request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait EditService: Send + Sync {
    async fn server_info(&self) -> Result<ServerInfo, ServiceError>;

    async fn create_session(
        &self,
        file_path: &Path,
        checkpoint_dir: Option<&Path>,
    ) -> Result<CreatedSession, ServiceError>;

    async fn destroy_session(&self, session_id: &SessionId) -> Result<(), ServiceError>;

    async fn create_viewport(
        &self,
        session_id: &SessionId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError>;

    async fn viewport_data(&self, viewport_id: &ViewportId) -> Result<ViewportData, ServiceError>;

    async fn modify_viewport(
        &self,
        viewport_id: &ViewportId,
        offset: u64,
        capacity: u64,
    ) -> Result<ViewportData, ServiceError>;

    async fn destroy_viewport(&self, viewport_id: &ViewportId) -> Result<(), ServiceError>;

    async fn submit_change(
        &self,
        session_id: &SessionId,
        change: &Change,
    ) -> Result<u64, ServiceError>;

    async fn undo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError>;

    async fn redo(&self, session_id: &SessionId) -> Result<Option<u64>, ServiceError>;

    async fn clear(&self, session_id: &SessionId) -> Result<(), ServiceError>;

    async fn counts(&self, session_id: &SessionId) -> Result<SessionCounts, ServiceError>;

    async fn search(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
    ) -> Result<Vec<u64>, ServiceError>;

    async fn replace_all(
        &self,
        session_id: &SessionId,
        query: &SearchQuery,
        replacement: &Bytes,
    ) -> Result<u64, ServiceError>;

    async fn save(
        &self,
        session_id: &SessionId,
        path: &Path,
        flags: SaveFlags,
    ) -> Result<SaveResponse, ServiceError>;

    async fn subscribe_viewport(
        &self,
        viewport_id: &ViewportId,
    ) -> Result<NotificationStream, ServiceError>;

    async fn pause_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError>;

    async fn resume_viewport_events(&self, session_id: &SessionId) -> Result<(), ServiceError>;

    async fn notify_changed_viewports(&self, session_id: &SessionId) -> Result<u64, ServiceError>;

    async fn heartbeat(
        &self,
        session_ids: &[SessionId],
        interval_ms: u64,
    ) -> Result<HeartbeatResponse, ServiceError>;
}

/// Non-overlapping, left-to-right matches of `query` in `content`.
///
/// Case folding is ASCII-only. Both backends share this so that `replace_all`
/// touches exactly what `search` reports.
pub fn find_matches(content: &[u8], query: &SearchQuery) -> Vec<u64> {
    let pattern = query.pattern.as_ref();
    let start = (query.start_offset as usize).min(content.len());
    let end = if query.search_length == 0 {
        content.len()
    } else {
        start
            .saturating_add(query.search_length as usize)
            .min(content.len())
    };
    if pattern.is_empty() || end - start < pattern.len() {
        return Vec::new();
    }

    let eq = |a: &[u8], b: &[u8]| {
        if query.case_insensitive {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    };

    let mut matches = Vec::new();
    let mut pos = start;
    while pos + pattern.len() <= end {
        if eq(&content[pos..pos + pattern.len()], pattern) {
            matches.push(pos as u64);
            if query.limit != 0 && matches.len() as u64 >= query.limit {
                break;
            }
            pos += pattern.len();
        } else {
            pos += 1;
        }
    }
    matches
}

pub(crate) mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_follows_byte_lengths() {
        assert_eq!(Change::new(0, "", "ab").kind(), ChangeKind::Insert);
        assert_eq!(Change::new(0, "ab", "").kind(), ChangeKind::Delete);
        assert_eq!(Change::new(0, "ab", "cd").kind(), ChangeKind::Overwrite);
        assert_eq!(Change::new(0, "ab", "xyz").kind(), ChangeKind::Replace);
        assert_eq!(Change::new(0, "ab", "xyz").size_delta(), 1);
    }

    #[test]
    fn case_insensitive_search_finds_every_spelling() {
        let mut content = vec![b'.'; 30];
        content[0..2].copy_from_slice(b"ab");
        content[10..12].copy_from_slice(b"AB");
        content[20..22].copy_from_slice(b"Ab");
        let query = SearchQuery::new("AB").case_insensitive(true);
        assert_eq!(find_matches(&content, &query), vec![0, 10, 20]);
        let exact = SearchQuery::new("AB");
        assert_eq!(find_matches(&content, &exact), vec![10]);
    }

    #[test]
    fn search_respects_bounds_and_limit() {
        let content = b"xxAAxxAAxxAA";
        let bounded = SearchQuery::new("AA").within(3, 6);
        assert_eq!(find_matches(content, &bounded), vec![6]);
        let limited = SearchQuery::new("AA").limit(2);
        assert_eq!(find_matches(content, &limited), vec![2, 6]);
    }

    #[test]
    fn matches_do_not_overlap() {
        assert_eq!(find_matches(b"aaaa", &SearchQuery::new("aa")), vec![0, 2]);
    }

    #[test]
    fn viewport_data_round_trips_bytes_as_base64() {
        let data = ViewportData {
            viewport_id: ViewportId::new("vp-1"),
            offset: 4,
            data: Bytes::from_static(&[0, 159, 255]),
            following_byte_count: 10,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["data"], "AJ//");
        let back: ViewportData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}
