//! Request and response debug capture
//!
//! When `debugPath` is configured, every forwarded request and the provider's
//! response are appended as JSON lines to a daily file in that directory. Capture is
//! best effort: failures are logged and never reach the request path.

use crate::config::SnapshotReader;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Header values never written to disk
const REDACTED_HEADERS: [&str; 3] = ["authorization", "api-key", "x-api-key"];

/// Which side of the exchange a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugKind {
    Request,
    Response,
}

/// One captured request or response
#[derive(Debug, Clone, Serialize)]
pub struct DebugRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: DebugKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl DebugRecord {
    /// Record an outbound request
    pub fn request(method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: DebugKind::Request,
            method: Some(method.to_string()),
            status: None,
            uri: uri.to_string(),
            headers: header_map(headers),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Record a provider response
    pub fn response(status: StatusCode, uri: &str, headers: &HeaderMap, body: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: DebugKind::Response,
            method: None,
            status: Some(status.as_u16()),
            uri: uri.to_string(),
            headers: header_map(headers),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        let value = if REDACTED_HEADERS.contains(&name.as_str()) {
            "<redacted>".to_string()
        } else {
            headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ")
        };
        map.insert(name.as_str().to_string(), value);
    }
    map
}

/// Destination for debug records
pub trait DebugSink: Send + Sync {
    /// Whether records would currently be kept
    ///
    /// Callers skip buffering response bodies when this is false.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Capture a record; never fails
    fn record(&self, record: DebugRecord);
}

/// Appends JSON lines to `<debugPath>/modelgate-debug-<YYYYMMDD>.jsonl`
///
/// The directory is read from the current snapshot on every record, so enabling
/// or moving the capture only takes a config reload.
pub struct FileDebugSink {
    config: SnapshotReader,
}

impl FileDebugSink {
    pub fn new(config: SnapshotReader) -> Self {
        Self { config }
    }

    /// File a record with this timestamp goes to
    pub fn file_path(dir: &Path, timestamp: &DateTime<Utc>) -> PathBuf {
        dir.join(format!("modelgate-debug-{}.jsonl", timestamp.format("%Y%m%d")))
    }
}

impl DebugSink for FileDebugSink {
    fn is_enabled(&self) -> bool {
        self.config.load().debug_path.is_some()
    }

    fn record(&self, record: DebugRecord) {
        let Some(dir) = self.config.load().debug_path.clone() else {
            return;
        };

        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize debug record: {}", e);
                return;
            }
        };
        let path = Self::file_path(Path::new(&dir), &record.timestamp);

        let write = move || {
            if let Err(e) = append_line(&path, &line) {
                warn!("Failed to write debug record to {:?}: {}", path, e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use http::HeaderValue;
    use tempfile::TempDir;

    fn sink(debug_path: Option<String>) -> FileDebugSink {
        let config = GatewayConfig {
            debug_path,
            ..Default::default()
        };
        FileDebugSink::new(SnapshotReader::fixed(config))
    }

    #[test]
    fn test_file_name_uses_record_date() {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T23:59:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            FileDebugSink::file_path(Path::new("/tmp/dbg"), &ts),
            PathBuf::from("/tmp/dbg/modelgate-debug-20240305.jsonl")
        );
    }

    #[test]
    fn test_disabled_without_debug_path() {
        let sink = sink(None);
        assert!(!sink.is_enabled());
        sink.record(DebugRecord::request(&Method::GET, "/x", &HeaderMap::new(), b""));
    }

    #[test]
    fn test_records_appended_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let sink = sink(Some(dir.path().to_string_lossy().into_owned()));
        assert!(sink.is_enabled());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let request = DebugRecord::request(&Method::POST, "https://up/v1", &headers, b"{\"a\":1}");
        let path = FileDebugSink::file_path(dir.path(), &request.timestamp);
        sink.record(request);
        sink.record(DebugRecord::response(StatusCode::OK, "https://up/v1", &HeaderMap::new(), b"ok"));

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "request");
        assert_eq!(lines[0]["method"], "POST");
        assert_eq!(lines[0]["headers"]["authorization"], "<redacted>");
        assert_eq!(lines[0]["body"], "{\"a\":1}");
        assert_eq!(lines[1]["kind"], "response");
        assert_eq!(lines[1]["status"], 200);
    }
}
