//! Ingress Adapter.
//!
//! Normalizes an external download request into a `Task` plus initial
//! transport hints. Grounded on `downloader.rs::probe_direct_file`'s
//! Content-Disposition filename extraction and path-traversal guard,
//! reused here for `suggestedFilename`.

use crate::error::{EngineError, EngineResult};
use crate::model::Task;
use crate::transport::resolve_destination;
use std::path::{Path, PathBuf};

/// §6 Download Request record.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub destination_folder: PathBuf,
    pub suggested_filename: Option<String>,
    pub cookies: Vec<(String, String)>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub preferred_connections: Option<u8>,
    pub queue_id: Option<String>,
    pub start_paused: bool,
    pub require_extension: bool,
    pub pre_known_content_type: Option<String>,
    pub pre_known_content_length: Option<u64>,
}

pub struct IngressAdapter;

impl IngressAdapter {
    /// Validates and normalizes a request into a pending (or paused) Task.
    /// Pre-known values are carried as hints: the coordinator's startup
    /// sequence always overrides them with probe results.
    pub fn normalize(request: DownloadRequest) -> EngineResult<Task> {
        let url = url::Url::parse(&request.url).map_err(|_| EngineError::InvalidUrl(request.url.clone()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(EngineError::InvalidUrl(format!("unsupported scheme: {}", url.scheme())));
        }

        let filename = request
            .suggested_filename
            .clone()
            .or_else(|| url.path_segments().and_then(|mut segs| segs.next_back()).map(|s| s.to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string());

        if request.require_extension && Path::new(&filename).extension().is_none() {
            return Err(EngineError::InvalidUrl("destination requires a file extension".into()));
        }

        let destination_path = resolve_destination(&request.destination_folder, &filename);

        let connections = request.preferred_connections.unwrap_or(8).clamp(1, 32);
        let mut task = Task::new(request.url, destination_path, connections);
        task.cookies = request.cookies;
        task.queue_id = request.queue_id;
        task.total_size = request.pre_known_content_length.unwrap_or(0);

        let mut headers = Vec::new();
        if let Some(referer) = request.referer {
            headers.push(("Referer".to_string(), referer));
        }
        if let Some(ua) = request.user_agent {
            headers.push(("User-Agent".to_string(), ua));
        }
        task.headers = headers;

        if request.start_paused {
            task.status = crate::model::TaskStatus::Paused;
        }

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> DownloadRequest {
        DownloadRequest {
            url: "https://example.com/files/archive.zip".into(),
            destination_folder: PathBuf::from("/tmp/downloads"),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_filename_from_url_path() {
        let task = IngressAdapter::normalize(base_request()).unwrap();
        assert_eq!(task.destination_path, PathBuf::from("/tmp/downloads/archive.zip"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        let mut req = base_request();
        req.url = "ftp://example.com/file.bin".into();
        assert!(IngressAdapter::normalize(req).is_err());
    }

    #[test]
    fn rejects_malformed_urls() {
        let mut req = base_request();
        req.url = "not a url".into();
        assert!(IngressAdapter::normalize(req).is_err());
    }

    #[test]
    fn suggested_filename_guards_against_path_traversal() {
        let mut req = base_request();
        req.suggested_filename = Some("../../etc/passwd".into());
        let task = IngressAdapter::normalize(req).unwrap();
        assert_eq!(task.destination_path, PathBuf::from("/tmp/downloads/passwd"));
    }

    #[test]
    fn require_extension_rejects_extensionless_filenames() {
        let mut req = base_request();
        req.url = "https://example.com/files/noext".into();
        req.require_extension = true;
        assert!(IngressAdapter::normalize(req).is_err());
    }

    #[test]
    fn preferred_connections_clamped_to_32() {
        let mut req = base_request();
        req.preferred_connections = Some(200);
        let task = IngressAdapter::normalize(req).unwrap();
        assert_eq!(task.connections, 32);
    }
}
