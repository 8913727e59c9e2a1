//! Streaming HTTP transfer helper.
//!
//! Wraps a shared `reqwest::Client` for file downloads: maps HTTP status
//! codes onto engine errors, derives the output filename from the
//! Content-Disposition header (falling back to a caller-provided template
//! or the URL), streams the body to disk with progress accounting, and
//! removes partial files on failure.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::filename::{disposition_filename, safe_filename, unique_path};
use super::DownloadedFile;
use crate::error::EngineError;

/// Log a progress line every this many bytes.
const PROGRESS_LOG_STEP: u64 = 5 * 1024 * 1024;

/// Streaming HTTP transfer client.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    /// Creates a transfer client with the given per-call timeout.
    ///
    /// `timeout_secs` bounds the connect phase; the whole request gets a
    /// generous 10x cap so large files still finish.
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            .timeout(Duration::from_secs(timeout_secs.max(1) * 10))
            .gzip(true)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Returns the underlying client for API calls sharing the pool.
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Downloads `url` into `dest_dir`, returning the saved path and size.
    ///
    /// Filename preference order: Content-Disposition header, then
    /// `template_name`, then the last URL path segment.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Auth`] for 401/403
    /// - [`EngineError::NotFound`] for 404/410
    /// - [`EngineError::DownloadLimitExhausted`] for 429, with the
    ///   Retry-After value as the reset time
    /// - [`EngineError::Network`] for transport failures and other statuses
    /// - [`EngineError::Io`] for filesystem failures
    #[instrument(skip(self, template_name), fields(url = %url))]
    pub async fn download_to_file(
        &self,
        url: &str,
        dest_dir: &Path,
        template_name: Option<&str>,
    ) -> Result<DownloadedFile, EngineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_transport_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(url, &response));
        }

        let disposition_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .map(|name| safe_filename(&name));

        let fallback_name = template_name
            .map(ToString::to_string)
            .or_else(|| last_url_segment(url))
            .unwrap_or_else(|| "download.bin".to_string());

        let filename = disposition_name.unwrap_or(fallback_name);

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = unique_path(dest_dir, &filename);

        let mut file = File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_downloaded: u64 = 0;
        let mut next_progress_log = PROGRESS_LOG_STEP;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Drop the partial file so a retry starts from scratch
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(map_transport_error(url, &e));
                }
            };
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
            if bytes_downloaded >= next_progress_log {
                debug!(bytes_downloaded, "transfer in progress");
                next_progress_log += PROGRESS_LOG_STEP;
            }
        }
        file.flush().await?;

        debug!(bytes_downloaded, path = %path.display(), "transfer complete");
        Ok(DownloadedFile {
            path,
            file_size: i64::try_from(bytes_downloaded).unwrap_or(i64::MAX),
        })
    }
}

fn last_url_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let segment = segment.trim();
    (!segment.is_empty()).then(|| safe_filename(segment))
}

fn map_transport_error(url: &str, error: &reqwest::Error) -> EngineError {
    if error.is_timeout() {
        EngineError::network(format!("timeout downloading {url}"))
    } else {
        EngineError::network(format!("connection error downloading {url}: {error}"))
    }
}

fn map_status_error(url: &str, response: &reqwest::Response) -> EngineError {
    let status = response.status().as_u16();
    match status {
        401 | 403 => EngineError::auth(format!("HTTP {status} downloading {url}")),
        404 | 410 => EngineError::not_found(format!("HTTP {status} downloading {url}")),
        429 => {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            if let Some(header) = &retry_after
                && retry_after_duration(header).is_none()
            {
                warn!(header = %header, "unparseable Retry-After header");
            }
            EngineError::DownloadLimitExhausted {
                message: format!("HTTP 429 downloading {url}"),
                reset_time: retry_after,
            }
        }
        _ => EngineError::network(format!("HTTP {status} downloading {url}")),
    }
}

/// Parses a Retry-After value: either delta-seconds or an HTTP-date.
#[must_use]
pub fn retry_after_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(server: &MockServer, route: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_download_uses_disposition_filename() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/dl/z9",
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="dune.epub""#)
                .set_body_bytes(vec![7u8; 4096]),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let file = transfer
            .download_to_file(&format!("{}/dl/z9", server.uri()), dir.path(), None)
            .await
            .unwrap();

        assert_eq!(file.path.file_name().unwrap(), "dune.epub");
        assert_eq!(file.file_size, 4096);
        assert_eq!(std::fs::metadata(&file.path).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_download_falls_back_to_template_name() {
        let server = MockServer::start().await;
        serve(&server, "/dl/z9", ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec())).await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let file = transfer
            .download_to_file(
                &format!("{}/dl/z9", server.uri()),
                dir.path(),
                Some("Frank_Herbert_Dune.epub"),
            )
            .await
            .unwrap();

        assert_eq!(file.path.file_name().unwrap(), "Frank_Herbert_Dune.epub");
    }

    #[tokio::test]
    async fn test_download_falls_back_to_url_segment() {
        let server = MockServer::start().await;
        serve(&server, "/dl/dune.epub", ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let file = transfer
            .download_to_file(&format!("{}/dl/dune.epub", server.uri()), dir.path(), None)
            .await
            .unwrap();

        assert_eq!(file.path.file_name().unwrap(), "dune.epub");
    }

    #[tokio::test]
    async fn test_download_404_maps_to_not_found() {
        let server = MockServer::start().await;
        serve(&server, "/dl/z9", ResponseTemplate::new(404)).await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let error = transfer
            .download_to_file(&format!("{}/dl/z9", server.uri()), dir.path(), None)
            .await
            .unwrap_err();

        assert!(matches!(error, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_403_maps_to_auth() {
        let server = MockServer::start().await;
        serve(&server, "/dl/z9", ResponseTemplate::new(403)).await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let error = transfer
            .download_to_file(&format!("{}/dl/z9", server.uri()), dir.path(), None)
            .await
            .unwrap_err();

        assert!(error.is_auth());
    }

    #[tokio::test]
    async fn test_download_429_maps_to_limit_exhausted_with_reset() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/dl/z9",
            ResponseTemplate::new(429).insert_header("retry-after", "3600"),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(5);
        let error = transfer
            .download_to_file(&format!("{}/dl/z9", server.uri()), dir.path(), None)
            .await
            .unwrap_err();

        match error {
            EngineError::DownloadLimitExhausted { reset_time, .. } => {
                assert_eq!(reset_time.as_deref(), Some("3600"));
            }
            other => panic!("expected DownloadLimitExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_duration_seconds_and_http_date() {
        assert_eq!(retry_after_duration("120"), Some(Duration::from_secs(120)));
        // A date in the past yields None
        assert_eq!(retry_after_duration("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(retry_after_duration("soonish"), None);
    }
}
