//! JSON bodies of the HTTP contract that are not already service types.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{SearchQuery, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ViewportRequest {
    pub offset: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SerialResponse {
    #[serde(default)]
    pub serial: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRequest {
    #[serde(flatten)]
    pub query: SearchQuery,
    #[serde(with = "super::b64")]
    pub replacement: Bytes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplaceResponse {
    pub replaced: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub path: PathBuf,
    pub overwrite: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub notified: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub session_ids: Vec<SessionId>,
    pub interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_request_flattens_query_fields() {
        let request = ReplaceRequest {
            query: SearchQuery::new("ab").case_insensitive(true).limit(3),
            replacement: Bytes::from_static(b"xy"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["pattern"], "YWI=");
        assert_eq!(json["case_insensitive"], true);
        assert_eq!(json["limit"], 3);
        assert_eq!(json["replacement"], "eHk=");
    }
}
