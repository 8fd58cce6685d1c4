use crate::fetch::{FetchError, Fetcher, DEFAULT_USER_AGENT};
use crate::mirror::{self, MirrorError, MirrorRunContext};
use crate::pool::{self, PoolOutcome};
use crate::storage::{self, SaveError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Immutable configuration for one download run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Absolute directory all downloads are rooted under.
    pub output_root: PathBuf,
    /// Number of concurrent workers; must be positive.
    pub max_concurrency: usize,
    /// Deadline applied to each URL's full processing; must be positive.
    pub request_timeout: Duration,
    /// Mirror mode: also fetch referenced assets and rewrite pages.
    pub download_assets: bool,
    /// Permit asset fetches from origins other than the page's.
    pub include_third_party_assets: bool,
}

/// Outcome for one requested URL. A failed URL is a data value, never a
/// run-level error.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub url: Url,
    pub success: bool,
    pub status: Option<u16>,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DownloadResult {
    fn succeeded(url: Url, status: u16, path: PathBuf) -> Self {
        Self {
            url,
            success: true,
            status: Some(status),
            path: Some(path),
            error: None,
        }
    }

    fn failed(url: Url, status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            url,
            success: false,
            status,
            path: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("max_concurrency must be greater than zero")]
    InvalidConcurrency,
    #[error("request_timeout must be greater than zero")]
    InvalidTimeout,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("run canceled")]
    Canceled,
}

/// What went wrong while handling a single URL, before it is flattened into
/// the `DownloadResult` error text.
enum PageFailure {
    Http(reqwest::StatusCode),
    Canceled,
    Transport(reqwest::Error),
    Save(SaveError),
    Mirror(MirrorError),
}

impl PageFailure {
    fn into_record(self) -> (Option<u16>, String) {
        match self {
            PageFailure::Http(status) => {
                let text = match status.canonical_reason() {
                    Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
                    None => format!("HTTP {}", status.as_u16()),
                };
                (Some(status.as_u16()), text)
            }
            PageFailure::Canceled => (None, "Canceled".to_string()),
            PageFailure::Save(SaveError::Canceled) => (None, "Canceled".to_string()),
            PageFailure::Mirror(MirrorError::Canceled) => (None, "Canceled".to_string()),
            PageFailure::Transport(err) => (None, err.to_string()),
            PageFailure::Save(err) => (None, err.to_string()),
            PageFailure::Mirror(err) => (None, err.to_string()),
        }
    }
}

/// Drives a whole run: fans the input URLs out over a bounded worker pool and
/// collects one result per URL. With `download_assets` enabled each page goes
/// through the mirror instead of the plain writer.
pub struct Downloader {
    options: RunOptions,
    fetcher: Fetcher,
}

impl Downloader {
    pub fn new(options: RunOptions) -> Result<Self, RunError> {
        let fetcher = Fetcher::new(DEFAULT_USER_AGENT)?;
        Ok(Self::with_fetcher(options, fetcher))
    }

    pub fn with_fetcher(options: RunOptions, fetcher: Fetcher) -> Self {
        Self { options, fetcher }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Download every URL, returning one record per URL in unspecified order.
    /// Configuration problems fail before any request is issued; root
    /// cancellation surfaces as `RunError::Canceled` and discards whatever
    /// was collected.
    pub async fn run(
        &self,
        urls: Vec<Url>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadResult>, RunError> {
        if self.options.max_concurrency == 0 {
            return Err(RunError::InvalidConcurrency);
        }
        if self.options.request_timeout.is_zero() {
            return Err(RunError::InvalidTimeout);
        }
        tokio::fs::create_dir_all(&self.options.output_root)
            .await
            .map_err(|source| RunError::OutputDir {
                path: self.options.output_root.clone(),
                source,
            })?;

        let context = self.options.download_assets.then(MirrorRunContext::new);
        info!(
            urls = urls.len(),
            workers = self.options.max_concurrency,
            mirroring = self.options.download_assets,
            "starting download run"
        );

        let results = Mutex::new(Vec::with_capacity(urls.len()));
        let this = self;
        let context_ref = context.as_ref();
        let results_ref = &results;
        let outcome = pool::run(
            urls,
            self.options.max_concurrency,
            cancel,
            move |url| async move {
                let result = this.process_one(url, context_ref, cancel).await;
                results_ref.lock().unwrap().push(result);
            },
        )
        .await;
        if outcome == PoolOutcome::Canceled {
            return Err(RunError::Canceled);
        }
        Ok(results.into_inner().unwrap())
    }

    /// Handle one URL under its own deadline. The per-request scope is the
    /// root token OR the timeout, whichever fires first; the root token wins
    /// the race so a canceled run is never misreported as a timeout.
    async fn process_one(
        &self,
        url: Url,
        context: Option<&MirrorRunContext>,
        cancel: &CancellationToken,
    ) -> DownloadResult {
        let deadline = self.options.request_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => DownloadResult::failed(url, None, "Canceled"),
            handled = tokio::time::timeout(deadline, self.handle_url(&url, context, cancel)) => {
                match handled {
                    Err(_) => DownloadResult::failed(
                        url,
                        None,
                        format!("Timeout after {}s", deadline.as_secs()),
                    ),
                    Ok(Ok((status, path))) => DownloadResult::succeeded(url, status, path),
                    Ok(Err(failure)) => {
                        let (status, error) = failure.into_record();
                        DownloadResult::failed(url, status, error)
                    }
                }
            }
        };
        if result.success {
            debug!(url = %result.url, path = ?result.path, "download complete");
        } else {
            debug!(url = %result.url, error = ?result.error, "download failed");
        }
        result
    }

    async fn handle_url(
        &self,
        url: &Url,
        context: Option<&MirrorRunContext>,
        cancel: &CancellationToken,
    ) -> Result<(u16, PathBuf), PageFailure> {
        let response = self
            .fetcher
            .fetch(url, cancel)
            .await
            .map_err(|err| match err {
                FetchError::Canceled => PageFailure::Canceled,
                FetchError::Transport(err) => PageFailure::Transport(err),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PageFailure::Http(status));
        }

        let path = match context {
            Some(context) => {
                mirror::mirror_page(&self.fetcher, url, response, &self.options, context, cancel)
                    .await
                    .map_err(PageFailure::Mirror)?
            }
            None => storage::save_response(url, response, &self.options.output_root, cancel)
                .await
                .map_err(PageFailure::Save)?,
        };
        Ok((status.as_u16(), path))
    }
}
