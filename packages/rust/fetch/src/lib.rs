//! Enrichment HTTP client.
//!
//! Plain GET/POST/HEAD and file downloads against auxiliary APIs that augment
//! reference records. Unlike the knowledge-base transport there is no retry
//! policy here: enrichment is best-effort and callers degrade on failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use refkb_shared::{RefKbError, Result};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, LAST_MODIFIED};
use reqwest::{Client, Response};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// User-Agent string for enrichment requests.
const USER_AGENT: &str = concat!("refkb/", env!("CARGO_PKG_VERSION"));

/// Default cap on attachment size (200 MB).
pub const MAX_DOWNLOAD_SIZE: u64 = 200 * 1024 * 1024;

// ---------------------------------------------------------------------------
// FileInfo
// ---------------------------------------------------------------------------

/// Headers of a remote file as reported by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
}

// ---------------------------------------------------------------------------
// EnrichmentClient
// ---------------------------------------------------------------------------

/// HTTP client for auxiliary metadata APIs and attachment downloads.
#[derive(Debug, Clone)]
pub struct EnrichmentClient {
    client: Client,
    max_download_size: u64,
}

impl EnrichmentClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| RefKbError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_download_size: MAX_DOWNLOAD_SIZE,
        })
    }

    /// Override the attachment size cap.
    pub fn with_max_download_size(mut self, bytes: u64) -> Self {
        self.max_download_size = bytes;
        self
    }

    /// GET a JSON document.
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RefKbError::Network(format!("{url}: {e}")))?;
        read_json(url, ensure_success(url, response)?).await
    }

    /// POST a JSON body and read a JSON reply.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RefKbError::Network(format!("{url}: {e}")))?;
        read_json(url, ensure_success(url, response)?).await
    }

    /// HEAD a URL and report its content headers.
    pub async fn file_info(&self, url: &str) -> Result<FileInfo> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| RefKbError::Network(format!("{url}: {e}")))?;
        let response = ensure_success(url, response)?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Ok(FileInfo {
            status: response.status().as_u16(),
            content_type: header(CONTENT_TYPE),
            content_length: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            last_modified: header(LAST_MODIFIED),
        })
    }

    /// Whether a HEAD request answers 200.
    pub async fn is_accessible(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(%url, error = %e, "url not accessible");
                false
            }
        }
    }

    /// Download `url` to `dest`, creating parent directories.
    ///
    /// The body is streamed to a sibling temp file and renamed into place, so
    /// `dest` exists only after a complete download. Returns the byte count.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RefKbError::io(parent, e))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RefKbError::Network(format!("{url}: {e}")))?;
        let response = ensure_success(url, response)?;

        if let Some(len) = response.content_length() {
            if len > self.max_download_size {
                return Err(too_large(url, len, self.max_download_size));
            }
        }

        let tmp = dest.with_extension("part");
        let written = match self.stream_to(url, response, &tmp).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| RefKbError::io(dest, e))?;

        info!(path = %dest.display(), bytes = written, "attachment downloaded");
        Ok(written)
    }

    /// Copy the body chunk by chunk into `tmp`, enforcing the size cap as
    /// bytes arrive. Bodies without a `Content-Length` are never buffered.
    async fn stream_to(&self, url: &str, mut response: Response, tmp: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| RefKbError::io(tmp, e))?;
        let mut written: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RefKbError::Network(format!("{url}: failed to read body: {e}")))?
        {
            written += chunk.len() as u64;
            if written > self.max_download_size {
                return Err(too_large(url, written, self.max_download_size));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| RefKbError::io(tmp, e))?;
        }
        file.flush().await.map_err(|e| RefKbError::io(tmp, e))?;
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_success(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(RefKbError::Network(format!("{url}: HTTP {status}")));
    }
    Ok(response)
}

fn too_large(url: &str, bytes: u64, max: u64) -> RefKbError {
    RefKbError::validation(format!(
        "{url}: attachment too large ({bytes} bytes, max {max})"
    ))
}

async fn read_json(url: &str, response: Response) -> Result<Value> {
    let text = response
        .text()
        .await
        .map_err(|e| RefKbError::Network(format!("{url}: failed to read body: {e}")))?;
    serde_json::from_str(&text)
        .map_err(|e| RefKbError::Enrichment(format!("{url}: invalid JSON: {e}")))
}

/// Local file name for an attachment URL.
///
/// Uses the last path segment when it looks like a file name, otherwise a
/// short SHA-256 of the URL. Always prefixed with [`file_stem_for_id`] of
/// `prefix` (the record id) so two records never collide in one scratch
/// directory or in the document ledger.
pub fn attachment_file_name(prefix: &str, url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_owned))
    });

    let name = match segment {
        Some(seg) if seg.contains('.') && !seg.starts_with('.') => sanitize_file_name(&seg),
        _ => format!("{}.bin", short_digest(url)),
    };
    format!("{}_{name}", file_stem_for_id(prefix))
}

/// File-name stem for a record id, distinct for distinct ids.
///
/// Ids that are already file-name safe are used as is. Otherwise the
/// sanitized id gets a short SHA-256 of the raw id appended, so `r/1` and
/// `r_1` do not share a stem.
pub fn file_stem_for_id(id: &str) -> String {
    let sanitized = sanitize_file_name(id);
    if sanitized == id {
        sanitized
    } else {
        format!("{sanitized}-{}", short_digest(id))
    }
}

/// Replace characters unsafe in a file name with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn short_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Join an API base URL with a record's source id.
pub fn api_link(base: &str, source_id: &str) -> Option<String> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let joined = Url::parse(&base).ok()?.join(source_id).ok()?;
    debug!(url = %joined, "resolved enrichment link");
    Some(joined.to_string())
}

/// Convenience for callers that keep scratch files under a run directory.
pub fn scratch_path(dir: &Path, prefix: &str, url: &str) -> PathBuf {
    dir.join(attachment_file_name(prefix, url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> EnrichmentClient {
        EnrichmentClient::new(Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn file_name_from_url_path() {
        assert_eq!(
            attachment_file_name("r-1", "https://cdn.example.com/files/Q3 report.pdf"),
            "r-1_Q3_20report.pdf"
        );
    }

    #[test]
    fn file_name_falls_back_to_digest() {
        let name = attachment_file_name("r-2", "https://cdn.example.com/download?id=9");
        assert!(name.starts_with("r-2_"));
        assert!(name.ends_with(".bin"));
        assert_eq!(name.len(), "r-2_".len() + 16 + ".bin".len());
        // Deterministic.
        assert_eq!(name, attachment_file_name("r-2", "https://cdn.example.com/download?id=9"));
    }

    #[test]
    fn id_stems_stay_distinct_after_sanitizing() {
        assert_eq!(file_stem_for_id("r-1"), "r-1");

        let slash = file_stem_for_id("r/1");
        let underscore = file_stem_for_id("r_1");
        assert_eq!(underscore, "r_1");
        assert!(slash.starts_with("r_1-"));
        assert_ne!(slash, underscore);
        assert_eq!(slash, file_stem_for_id("r/1"));

        let url = "https://cdn.example.com/files/a.pdf";
        assert_ne!(attachment_file_name("r/1", url), attachment_file_name("r_1", url));
        assert_eq!(attachment_file_name("r_1", url), "r_1_a.pdf");
    }

    #[test]
    fn api_link_joins_with_one_slash() {
        assert_eq!(
            api_link("https://meta.example.com/reports", "42").as_deref(),
            Some("https://meta.example.com/reports/42")
        );
        assert_eq!(
            api_link("https://meta.example.com/reports/", "42").as_deref(),
            Some("https://meta.example.com/reports/42")
        );
        assert_eq!(api_link("not a url", "42"), None);
    }

    #[tokio::test]
    async fn get_json_passes_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reports/42"))
            .and(query_param("lang", "en"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pages": 12})))
            .mount(&server)
            .await;

        let body = client()
            .get_json(&format!("{}/reports/42", server.uri()), &[("lang", "en".into())])
            .await
            .expect("json");
        assert_eq!(body["pages"], 12);
    }

    #[tokio::test]
    async fn http_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client()
            .get_json(&format!("{}/reports/1", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RefKbError::Network(_)));
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn invalid_json_is_enrichment_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = client()
            .post_json(&server.uri(), &json!({"q": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, RefKbError::Enrichment(_)));
    }

    #[tokio::test]
    async fn download_writes_file_atomically() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("refkb_dl_{}", Uuid::now_v7()));
        let dest = dir.join("nested").join("a.pdf");
        let written = client()
            .download(&format!("{}/files/a.pdf", server.uri()), &dest)
            .await
            .expect("download");

        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.7");
        assert!(!dest.with_extension("part").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("refkb_dl_{}", Uuid::now_v7()));
        let dest = dir.join("missing.pdf");
        assert!(client().download(&format!("{}/x.pdf", server.uri()), &dest).await.is_err());
        assert!(!dest.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    /// Serve one response with a chunked body and no `Content-Length`.
    async fn chunked_server(body: Vec<u8>) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;

            let mut response =
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
            for chunk in body.chunks(16) {
                response.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                response.extend_from_slice(chunk);
                response.extend_from_slice(b"\r\n");
            }
            response.extend_from_slice(b"0\r\n\r\n");
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/files/stream.bin")
    }

    #[tokio::test]
    async fn chunked_download_without_length_is_written() {
        let url = chunked_server(vec![b'a'; 40]).await;
        let dir = std::env::temp_dir().join(format!("refkb_dl_{}", Uuid::now_v7()));
        let dest = dir.join("stream.bin");

        let written = client()
            .with_max_download_size(64)
            .download(&url, &dest)
            .await
            .expect("download");
        assert_eq!(written, 40);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 40);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn chunked_download_over_cap_is_rejected() {
        let url = chunked_server(vec![b'a'; 100]).await;
        let dir = std::env::temp_dir().join(format!("refkb_dl_{}", Uuid::now_v7()));
        let dest = dir.join("stream.bin");

        let err = client()
            .with_max_download_size(64)
            .download(&url, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, RefKbError::Validation { .. }));
        assert!(err.to_string().contains("too large"));
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn declared_length_over_cap_is_rejected_up_front() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/big.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 128]))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("refkb_dl_{}", Uuid::now_v7()));
        let dest = dir.join("big.pdf");
        let err = client()
            .with_max_download_size(64)
            .download(&format!("{}/files/big.pdf", server.uri()), &dest)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("128 bytes"));
        assert!(!dest.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn head_reports_file_info() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/files/a.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .insert_header("last-modified", "Tue, 01 Oct 2024 10:00:00 GMT"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/files/gone.pdf"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let c = client();
        let info = c
            .file_info(&format!("{}/files/a.pdf", server.uri()))
            .await
            .expect("head");
        assert_eq!(info.status, 200);
        assert_eq!(info.content_type.as_deref(), Some("application/pdf"));
        assert!(info.last_modified.is_some());

        assert!(c.is_accessible(&format!("{}/files/a.pdf", server.uri())).await);
        assert!(!c.is_accessible(&format!("{}/files/gone.pdf", server.uri())).await);
    }
}
