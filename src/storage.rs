use crate::paths::output_path;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Canceled")]
    Canceled,
    #[error("failed to read response body: {0}")]
    Body(#[from] reqwest::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The response's declared content type, if it is representable as text.
pub fn content_type_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Stream a response body to the path materialized for its URL and declared
/// content type. Parent directories are created as needed and the body is
/// copied chunk by chunk, never fully buffered. Cancellation aborts the copy
/// mid-stream and leaves the partial file behind.
pub async fn save_response(
    url: &Url,
    response: Response,
    output_root: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, SaveError> {
    let content_type = content_type_of(&response);
    let path = output_path(output_root, url, content_type.as_deref());
    write_body(response, &path, cancel).await?;
    Ok(path)
}

/// Copy a response body into a freshly created file at `path`.
pub async fn write_body(
    response: Response,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<(), SaveError> {
    let io_err = |source| SaveError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(SaveError::Canceled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = next else { break };
        let bytes = chunk?;
        file.write_all(&bytes).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    Ok(())
}
