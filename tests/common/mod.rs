//! In-process HTTP stub for the cross-module end-to-end tests.
//!
//! Grounded on `other_examples`' `thin-edge` `partial_response.rs` tests:
//! a raw `tokio::net::TcpListener` accept loop, hand-parsed request lines,
//! hand-written status lines. No mock-HTTP-server crate is pulled in for
//! this, since the crate under test doesn't depend on one.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StubState {
    pub content: Vec<u8>,
    pub accepts_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl StubState {
    pub fn new(content: Vec<u8>) -> Self {
        Self { content, accepts_ranges: true, etag: None, last_modified: None }
    }
}

/// Deterministic content: byte `i` is `(i % 256) as u8`. Cheap to
/// regenerate for comparison, no SHA crate required to assert equality.
pub fn reference_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Same hand-rolled temp-dir helper `writer.rs`'s own tests use, so these
/// integration tests don't need a `tempfile` dev-dependency either.
pub struct TempDir(pub std::path::PathBuf);

impl TempDir {
    pub fn new() -> Self {
        let mut p = std::env::temp_dir();
        p.push(format!("multiget-e2e-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        Self(p)
    }

    pub fn child(&self, name: &str) -> std::path::PathBuf {
        self.0.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Binds a loopback listener and serves `state` until the returned handle
/// is aborted. Returns the resolved `http://127.0.0.1:<port>/file.bin` URL.
pub async fn spawn_stub(state: StubState) -> (String, Arc<Mutex<StubState>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shared = Arc::new(Mutex::new(state));
    let accept_state = shared.clone();

    let handle = tokio::spawn(async move {
        while let Ok((stream, _addr)) = listener.accept().await {
            let st = accept_state.clone();
            tokio::spawn(async move {
                let _ = handle_conn(stream, st).await;
            });
        }
    });

    // Give the spawned accept loop a moment to start accepting, the same
    // way the thin-edge stub server tests do.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{}/file.bin", port), shared, handle)
}

async fn handle_conn(mut stream: tokio::net::TcpStream, state: Arc<Mutex<StubState>>) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or("");
    let method = request_line.split_whitespace().next().unwrap_or("GET").to_string();

    let mut range_header = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range_header = Some(value.trim().to_string());
            }
        }
    }

    let snapshot = state.lock().await.clone();
    let total = snapshot.content.len() as u64;

    let mut common_headers = String::new();
    common_headers.push_str("Connection: close\r\n");
    common_headers.push_str(if snapshot.accepts_ranges { "Accept-Ranges: bytes\r\n" } else { "Accept-Ranges: none\r\n" });
    if let Some(etag) = &snapshot.etag {
        common_headers.push_str(&format!("ETag: \"{}\"\r\n", etag));
    }
    if let Some(lm) = &snapshot.last_modified {
        common_headers.push_str(&format!("Last-Modified: {}\r\n", lm));
    }

    if method == "HEAD" {
        let response = format!("HTTP/1.1 200 OK\r\n{}Content-Length: {}\r\n\r\n", common_headers, total);
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if !snapshot.accepts_ranges || range_header.is_none() {
        let response = format!("HTTP/1.1 200 OK\r\n{}Content-Length: {}\r\n\r\n", common_headers, total);
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(&snapshot.content).await?;
        return Ok(());
    }

    match parse_range(range_header.as_deref().unwrap(), total) {
        Some((start, end)) => {
            let slice = &snapshot.content[start as usize..=end as usize];
            let response = format!(
                "HTTP/1.1 206 Partial Content\r\n{}Content-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\n\r\n",
                common_headers,
                start,
                end,
                total,
                slice.len(),
            );
            stream.write_all(response.as_bytes()).await?;
            stream.write_all(slice).await?;
        }
        None => {
            let response = format!("HTTP/1.1 416 Range Not Satisfiable\r\n{}Content-Range: bytes */{}\r\n\r\n", common_headers, total);
            stream.write_all(response.as_bytes()).await?;
        }
    }
    Ok(())
}

fn parse_range(range: &str, total: u64) -> Option<(u64, u64)> {
    let spec = range.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    let end: u64 = if end_str.is_empty() { total.saturating_sub(1) } else { end_str.parse().ok()? };
    if total == 0 || start >= total || start > end {
        return None;
    }
    Some((start, end.min(total - 1)))
}
