//! Network Transport.
//!
//! Two operations: a metadata probe and a ranged streaming read. The
//! probe prefers HEAD (as the engine always has) and falls back to a
//! ranged GET `bytes=0-0` when the origin rejects HEAD, parsing
//! Content-Range instead of Content-Length in that case.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{
    HeaderMap, ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG,
    LAST_MODIFIED, RANGE, REFERER, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

const USER_AGENT_STRING: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub content_length: u64,
    pub accepts_ranges: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub resolved_url: String,
    pub suggested_filename: Option<String>,
}

/// End of range is open when the caller doesn't know (or care about) an
/// upper bound yet — readRange sends `bytes=start-` instead of
/// `bytes=start-end` in that case.
#[derive(Debug, Clone, Copy)]
pub enum RangeEnd {
    Open,
    At(u64),
}

pub struct Transport {
    client: Client,
}

impl Transport {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(idle_timeout * 20) // generous overall cap; idle stalls are caught per-chunk by the caller
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub async fn probe(&self, url: &str) -> EngineResult<ProbeResult> {
        let head_result = self
            .client
            .head(url)
            .header(USER_AGENT, USER_AGENT_STRING)
            .send()
            .await;

        match head_result {
            Ok(resp) if resp.status().is_success() => {
                Ok(Self::parse_head_response(url, resp))
            }
            _ => self.probe_via_ranged_get(url).await,
        }
    }

    fn parse_head_response(url: &str, resp: reqwest::Response) -> ProbeResult {
        let resolved_url = resp.url().to_string();
        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        ProbeResult {
            content_length,
            accepts_ranges,
            last_modified: header_str(headers, LAST_MODIFIED),
            etag: header_str(headers, ETAG),
            resolved_url: if resolved_url.is_empty() { url.to_string() } else { resolved_url },
            suggested_filename: extract_filename(headers),
        }
    }

    /// Fallback probe for origins that reject HEAD (403/405): a ranged
    /// GET for a single byte, reading Content-Range instead of
    /// Content-Length.
    async fn probe_via_ranged_get(&self, url: &str) -> EngineResult<ProbeResult> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .header(USER_AGENT, USER_AGENT_STRING)
            .send()
            .await
            .map_err(EngineError::from)?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            return Err(EngineError::from(resp.error_for_status().unwrap_err()));
        }

        let resolved_url = resp.url().to_string();
        let headers = resp.headers().clone();

        let content_length = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| {
                headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(0);

        let accepts_ranges = status == StatusCode::PARTIAL_CONTENT
            || headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

        Ok(ProbeResult {
            content_length,
            accepts_ranges,
            last_modified: header_str(&headers, LAST_MODIFIED),
            etag: header_str(&headers, ETAG),
            resolved_url: if resolved_url.is_empty() { url.to_string() } else { resolved_url },
            suggested_filename: extract_filename(&headers),
        })
    }

    /// Ranged streaming read. Maps transport/HTTP failures onto the
    /// error taxonomy: 416 -> rangeNotSatisfiable, 503 -> serviceUnavailable,
    /// other non-2xx/206 -> serverError, network failure -> connectionFailed.
    pub async fn read_range(
        &self,
        url: &str,
        start: u64,
        end: RangeEnd,
    ) -> EngineResult<impl Stream<Item = EngineResult<Bytes>>> {
        let mut req = self
            .client
            .get(url)
            .header(USER_AGENT, USER_AGENT_STRING)
            .header(REFERER, url)
            .header(ACCEPT_ENCODING, "identity");

        req = match (start, end) {
            (0, RangeEnd::Open) => req,
            (s, RangeEnd::Open) => req.header(RANGE, format!("bytes={}-", s)),
            (s, RangeEnd::At(e)) => req.header(RANGE, format!("bytes={}-{}", s, e)),
        };

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                EngineError::ConnectionFailed(e.to_string())
            } else {
                EngineError::from(e)
            }
        })?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(EngineError::RangeNotSatisfiable);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(EngineError::ServiceUnavailable);
        }
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Err(EngineError::ServerError(status.as_u16()));
        }

        let stream = resp.bytes_stream().map(|item| {
            item.map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    EngineError::ConnectionFailed(e.to_string())
                } else {
                    EngineError::from(e)
                }
            })
        });
        Ok(stream)
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

/// Parses `Content-Range: bytes 0-0/12345` into the total length (12345).
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|s| s.parse::<u64>().ok())
}

/// Content-Disposition filename extraction, including the RFC 5987
/// `filename*=UTF-8''...` form. Guards against path traversal by taking
/// only the final path component of whatever the server sent.
fn extract_filename(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("content-disposition").and_then(|v| v.to_str().ok())?;

    let extracted = if let Some(pos) = raw.find("filename*=") {
        let rest = &raw[pos + "filename*=".len()..];
        rest.split("''")
            .nth(1)
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
    } else if let Some(pos) = raw.find("filename=") {
        let rest = &raw[pos + "filename=".len()..];
        let trimmed = rest.trim_start_matches('"');
        trimmed
            .split('"')
            .next()
            .or_else(|| rest.split(';').next())
            .map(|s| s.trim().to_string())
    } else {
        None
    };

    extracted.map(|name| safe_file_name(&name))
}

fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}

/// Resolves a suggested filename to a full destination path, applying
/// the same traversal guard as the Content-Disposition parser.
pub fn resolve_destination(folder: &Path, suggested: &str) -> PathBuf {
    folder.join(safe_file_name(suggested))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes */12345"), Some(12345));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn filename_quoted_form() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-disposition",
            HeaderValue::from_static(r#"attachment; filename="archive.zip""#),
        );
        assert_eq!(extract_filename(&headers), Some("archive.zip".to_string()));
    }

    #[test]
    fn filename_star_form_decodes_utf8() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-disposition",
            HeaderValue::from_static("attachment; filename*=UTF-8''na%C3%AFve.txt"),
        );
        assert_eq!(extract_filename(&headers), Some("na\u{ef}ve.txt".to_string()));
    }

    #[test]
    fn filename_rejects_path_traversal() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-disposition",
            HeaderValue::from_static(r#"attachment; filename="../../etc/passwd""#),
        );
        assert_eq!(extract_filename(&headers), Some("passwd".to_string()));
    }

    #[test]
    fn safe_file_name_strips_directories() {
        assert_eq!(safe_file_name("../../secret"), "secret");
        assert_eq!(safe_file_name("plain.bin"), "plain.bin");
    }
}
