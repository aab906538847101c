use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Remote fetches are bounded so a slow upstream cannot stall a worker.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Upload transfer cap, enforced incrementally while chunks arrive.
pub const UPLOAD_CAP_BYTES: usize = 50 * 1024 * 1024;

/// Where the bytes of a request come from. Constructed once per request and
/// never mutated.
#[derive(Debug, Clone)]
pub enum RawSource {
    RemoteUrl(String),
    LocalPath(String),
    UploadedBytes {
        bytes: Vec<u8>,
        filename: String,
        content_type: Option<String>,
    },
}

impl RawSource {
    /// Human-readable label used in response metadata and logs.
    pub fn label(&self) -> String {
        match self {
            RawSource::RemoteUrl(url) => url.clone(),
            RawSource::LocalPath(path) => path.clone(),
            RawSource::UploadedBytes { filename, .. } => format!("upload:{filename}"),
        }
    }
}

/// Raw bytes plus the transport-level hints the unwrapper keys on.
#[derive(Debug)]
pub struct Acquired {
    pub bytes: Vec<u8>,
    /// Filename or URL the bytes came from; suffix drives archive routing.
    pub hint: String,
    /// Declared content type (HTTP header or multipart field), if any.
    pub declared_type: Option<String>,
}

/// Resolve a source descriptor into raw bytes. Remote errors are terminal and
/// never retried.
pub async fn acquire(
    client: &reqwest::Client,
    public_dir: &Path,
    source: &RawSource,
) -> PipelineResult<Acquired> {
    match source {
        RawSource::RemoteUrl(url) => fetch_remote(client, url).await,
        RawSource::LocalPath(path) => read_local(public_dir, path),
        RawSource::UploadedBytes {
            bytes,
            filename,
            content_type,
        } => Ok(Acquired {
            bytes: bytes.clone(),
            hint: filename.clone(),
            declared_type: content_type.clone(),
        }),
    }
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> PipelineResult<Acquired> {
    let resp = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(url, e))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(PipelineError::Fetch {
            status: Some(status.as_u16()),
            message: format!("GET {url}"),
        });
    }

    let declared_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(url, e))?;

    Ok(Acquired {
        bytes: bytes.to_vec(),
        hint: url.to_string(),
        declared_type,
    })
}

fn classify_reqwest_error(url: &str, e: reqwest::Error) -> PipelineError {
    if e.is_timeout() {
        PipelineError::Timeout(format!("GET {url}"))
    } else {
        PipelineError::Fetch {
            status: e.status().map(|s| s.as_u16()),
            message: format!("GET {url}: {e}"),
        }
    }
}

fn read_local(public_dir: &Path, path: &str) -> PipelineResult<Acquired> {
    let resolved = resolve_in_sandbox(public_dir, path)
        .ok_or_else(|| PipelineError::NotFound(format!("local file {path}")))?;
    let bytes = std::fs::read(&resolved)
        .map_err(|_| PipelineError::NotFound(format!("local file {path}")))?;
    Ok(Acquired {
        bytes,
        hint: path.to_string(),
        declared_type: None,
    })
}

/// Join `path` under `public_dir` and refuse any resolution that escapes it.
/// Traversal attempts come back as `None` so the caller reports a plain
/// not-found without leaking filesystem layout.
fn resolve_in_sandbox(public_dir: &Path, path: &str) -> Option<PathBuf> {
    let rel = path.trim_start_matches('/');
    let root = public_dir.canonicalize().ok()?;
    let candidate = root.join(rel).canonicalize().ok()?;
    if candidate.starts_with(&root) {
        Some(candidate)
    } else {
        None
    }
}

/// Append one transfer chunk to an upload buffer, enforcing `cap`. The first
/// chunk that pushes the running total past the cap aborts the transfer and
/// discards everything buffered so far.
pub fn append_upload_chunk(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> PipelineResult<()> {
    if buf.len() + chunk.len() > cap {
        buf.clear();
        return Err(PipelineError::PayloadTooLarge(format!(
            "upload exceeds {cap} bytes"
        )));
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rates.csv"), b"code\n1\n").unwrap();
        let outside = dir.path().parent().unwrap().join("secret.txt");
        let _ = std::fs::write(&outside, b"nope");

        assert!(resolve_in_sandbox(dir.path(), "rates.csv").is_some());
        assert!(resolve_in_sandbox(dir.path(), "/rates.csv").is_some());
        assert!(resolve_in_sandbox(dir.path(), "../secret.txt").is_none());
        assert!(resolve_in_sandbox(dir.path(), "missing.csv").is_none());
    }

    #[test]
    fn upload_cap_aborts_mid_transfer() {
        let mut buf = Vec::new();
        append_upload_chunk(&mut buf, &[0u8; 600], 1024).unwrap();
        let err = append_upload_chunk(&mut buf, &[0u8; 600], 1024).unwrap_err();
        assert!(matches!(err, PipelineError::PayloadTooLarge(_)));
        // Buffered chunks are discarded, not kept around.
        assert!(buf.is_empty());
    }

    #[test]
    fn upload_cap_allows_exact_fit() {
        let mut buf = Vec::new();
        append_upload_chunk(&mut buf, &[0u8; 1024], 1024).unwrap();
        assert_eq!(buf.len(), 1024);
    }
}
