use crate::assets::{self, AssetReference};
use crate::css;
use crate::downloader::RunOptions;
use crate::fetch::Fetcher;
use crate::paths::output_path;
use crate::pool::{self, PoolOutcome};
use crate::storage;
use dashmap::DashMap;
use lol_html::{element, HtmlRewriter, Settings};
use select::document::Document;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Schemes whose references are never fetchable subresources.
const SKIPPED_SCHEMES: &[&str] = &["data:", "mailto:", "javascript:", "about:", "blob:"];

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Canceled")]
    Canceled,
    #[error("failed to read page body: {0}")]
    Body(#[from] reqwest::Error),
    #[error("page body is not valid UTF-8 text")]
    Undecodable,
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rewrite document: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

/// A subresource that made it to disk.
#[derive(Debug, Clone)]
pub struct DownloadedAsset {
    pub url: Url,
    pub path: PathBuf,
    pub content_type: Option<String>,
}

/// Run-scoped deduplication of asset work. `fetched` keys each URL to a cell
/// whose fetch runs at most once; concurrent callers for the same URL wait on
/// the first one's outcome, and a `None` outcome records a failed or skipped
/// fetch. `css_processed` tracks the dependency stage of page-referenced
/// stylesheets separately, so it runs exactly once per stylesheet no matter
/// which caller performed the fetch.
#[derive(Debug, Default)]
pub struct MirrorRunContext {
    fetched: DashMap<String, Arc<OnceCell<Option<DownloadedAsset>>>>,
    css_processed: DashMap<String, Arc<OnceCell<()>>>,
}

impl MirrorRunContext {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_fetch<F, Fut>(&self, url: &Url, factory: F) -> Option<DownloadedAsset>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<DownloadedAsset>>,
    {
        let cell = self
            .fetched
            .entry(url.as_str().to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_init(factory).await.clone()
    }

    /// Run `work` at most once per URL per run; later callers wait for the
    /// first one to finish and then skip.
    async fn process_css_once<F, Fut>(&self, url: &Url, work: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let cell = self
            .css_processed
            .entry(url.as_str().to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_init(work).await;
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.fetched.len()
    }
}

/// Save an HTML page plus the assets it references, rewriting the stored
/// document so it renders offline. Returns the path of the written HTML.
pub async fn mirror_page(
    fetcher: &Fetcher,
    page_url: &Url,
    response: reqwest::Response,
    options: &RunOptions,
    ctx: &MirrorRunContext,
    cancel: &CancellationToken,
) -> Result<PathBuf, MirrorError> {
    let job = MirrorJob {
        fetcher,
        options,
        ctx,
        page_url,
        cancel,
    };
    job.mirror(response).await
}

#[derive(Clone, Copy)]
struct MirrorJob<'a> {
    fetcher: &'a Fetcher,
    options: &'a RunOptions,
    ctx: &'a MirrorRunContext,
    page_url: &'a Url,
    cancel: &'a CancellationToken,
}

impl MirrorJob<'_> {
    async fn mirror(&self, response: reqwest::Response) -> Result<PathBuf, MirrorError> {
        // The page itself is always written as HTML, whatever the server
        // declared for it.
        let html_path = output_path(&self.options.output_root, self.page_url, Some("text/html"));
        if let Some(parent) = html_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }

        let bytes = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MirrorError::Canceled),
            body = response.bytes() => body?,
        };
        let body = String::from_utf8(bytes.to_vec()).map_err(|_| MirrorError::Undecodable)?;

        let references = assets::extract_assets(&Document::from(body.as_str()));
        if references.is_empty() {
            tokio::fs::write(&html_path, body.as_bytes())
                .await
                .map_err(|source| io_error(&html_path, source))?;
            return Ok(html_path);
        }

        let targets = self.collect_targets(&references);
        debug!(
            page = %self.page_url,
            assets = targets.len(),
            "fetching page assets"
        );

        let fetched = Mutex::new(HashMap::new());
        let job = *self;
        let sink = &fetched;
        let outcome = pool::run(
            targets,
            self.options.max_concurrency,
            self.cancel,
            move |asset_url| async move {
                if let Some(asset) = job.fetch_asset(&asset_url).await {
                    sink.lock()
                        .unwrap()
                        .insert(asset_url.as_str().to_string(), asset);
                }
            },
        )
        .await;
        if outcome == PoolOutcome::Canceled {
            return Err(MirrorError::Canceled);
        }

        let fetched = fetched.into_inner().unwrap();
        let html_dir = html_path.parent().unwrap_or_else(|| Path::new(""));
        let rewritten = rewrite_document(&body, self.page_url, html_dir, &fetched)?;
        tokio::fs::write(&html_path, rewritten)
            .await
            .map_err(|source| io_error(&html_path, source))?;
        Ok(html_path)
    }

    /// Resolve, filter and dedup the extracted references into the set of
    /// URLs worth fetching, in first-seen order.
    fn collect_targets(&self, references: &[AssetReference]) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for reference in references {
            let Some(raw) = reference.target() else {
                continue;
            };
            let Some(resolved) = resolve_reference(raw, self.page_url) else {
                continue;
            };
            if !self.is_fetchable(&resolved) {
                continue;
            }
            if seen.insert(resolved.as_str().to_string()) {
                targets.push(resolved);
            }
        }
        targets
    }

    fn is_fetchable(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        self.options.include_third_party_assets || same_origin(url, self.page_url)
    }

    /// Dedup-aware fetch of one page-referenced asset. Whoever reaches a URL
    /// first performs the single fetch; when the asset turns out to be a
    /// stylesheet, its dependency stage is tracked in its own once-per-run
    /// cell, so it still runs even when some other stylesheet's dependency
    /// discovery won the fetch.
    async fn fetch_asset(&self, url: &Url) -> Option<DownloadedAsset> {
        let asset = self
            .ctx
            .get_or_fetch(url, || async move { self.fetch_and_store(url).await })
            .await?;
        if is_stylesheet(&asset) {
            let asset_ref = &asset;
            self.ctx
                .process_css_once(url, || async move {
                    if let Err(err) = self.process_stylesheet(asset_ref).await {
                        debug!(css = %url, error = %err, "stylesheet dependencies not resolved");
                    }
                })
                .await;
        }
        Some(asset)
    }

    /// Fetch one URL and stream it to disk. Any failure records the asset as
    /// absent; asset failures never propagate to the page.
    async fn fetch_and_store(&self, url: &Url) -> Option<DownloadedAsset> {
        let response = match self.fetcher.fetch(url, self.cancel).await {
            Ok(response) => response,
            Err(err) => {
                debug!(asset = %url, error = %err, "asset fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(asset = %url, status = %response.status(), "asset fetch returned an error status");
            return None;
        }
        let content_type = storage::content_type_of(&response);
        let path = match storage::save_response(url, response, &self.options.output_root, self.cancel)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                debug!(asset = %url, error = %err, "asset save failed");
                return None;
            }
        };
        Some(DownloadedAsset {
            url: url.clone(),
            path,
            content_type,
        })
    }

    /// One-level CSS dependency stage: fetch everything the stylesheet's
    /// `url(...)` declarations point at, then rewrite the stylesheet in place
    /// so those references become relative local paths. Dependencies that are
    /// themselves stylesheets are not descended into.
    async fn process_stylesheet(&self, asset: &DownloadedAsset) -> Result<(), MirrorError> {
        let css_text = tokio::fs::read_to_string(&asset.path)
            .await
            .map_err(|source| io_error(&asset.path, source))?;

        let mut seen = HashSet::new();
        let mut dependencies = Vec::new();
        for target in css::find_urls(&css_text) {
            let Some(resolved) = resolve_reference(&target, &asset.url) else {
                continue;
            };
            if !self.is_fetchable(&resolved) {
                continue;
            }
            if seen.insert(resolved.as_str().to_string()) {
                dependencies.push(resolved);
            }
        }
        if dependencies.is_empty() {
            return Ok(());
        }

        let fetched = Mutex::new(HashMap::new());
        let job = *self;
        let sink = &fetched;
        let outcome = pool::run(
            dependencies,
            self.options.max_concurrency,
            self.cancel,
            move |dep_url| async move {
                let dep_ref = &dep_url;
                let dep = job
                    .ctx
                    .get_or_fetch(dep_ref, || async move { job.fetch_and_store(dep_ref).await })
                    .await;
                if let Some(dep) = dep {
                    sink.lock()
                        .unwrap()
                        .insert(dep_url.as_str().to_string(), dep);
                }
            },
        )
        .await;
        if outcome == PoolOutcome::Canceled {
            return Err(MirrorError::Canceled);
        }

        let fetched = fetched.into_inner().unwrap();
        let css_dir = asset.path.parent().unwrap_or_else(|| Path::new(""));
        let rewritten = css::rewrite_urls(&css_text, |target| {
            let resolved = resolve_reference(target, &asset.url)?;
            let dep = fetched.get(resolved.as_str())?;
            Some(relative_local_path(css_dir, &dep.path))
        });
        tokio::fs::write(&asset.path, rewritten)
            .await
            .map_err(|source| io_error(&asset.path, source))?;
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> MirrorError {
    MirrorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve a raw reference the way a browser would, minus the unfetchable
/// cases: whitespace-only values and non-HTTP pseudo-schemes resolve to
/// nothing, protocol-relative references inherit the base scheme, everything
/// else joins against the base URL.
pub fn resolve_reference(raw: &str, base: &Url) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|prefix| lower.starts_with(prefix)) {
        return None;
    }
    if trimmed.starts_with("//") {
        return Url::parse(&format!("{}:{}", base.scheme(), trimmed)).ok();
    }
    base.join(trimmed).ok()
}

/// Same scheme, host and effective port (80/443 when implicit).
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn is_stylesheet(asset: &DownloadedAsset) -> bool {
    if let Some(content_type) = &asset.content_type {
        if content_type
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/css"))
        {
            return true;
        }
    }
    asset
        .path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("css"))
}

/// Relative path from `from_dir` to `to`, normalized to `/` separators so it
/// is valid inside HTML and CSS on every platform.
fn relative_local_path(from_dir: &Path, to: &Path) -> String {
    let relative = pathdiff::diff_paths(to, from_dir).unwrap_or_else(|| to.to_path_buf());
    relative.to_string_lossy().replace('\\', "/")
}

/// Streaming rewrite pass over the original document text: every asset
/// attribute whose resolved URL was fetched is pointed at the local copy;
/// everything else is emitted untouched.
fn rewrite_document(
    html: &str,
    page_url: &Url,
    html_dir: &Path,
    fetched: &HashMap<String, DownloadedAsset>,
) -> Result<String, lol_html::errors::RewritingError> {
    let lookup = |raw: &str| -> Option<String> {
        let resolved = resolve_reference(raw, page_url)?;
        let asset = fetched.get(resolved.as_str())?;
        Some(relative_local_path(html_dir, &asset.path))
    };
    let lookup = &lookup;

    let mut handlers = Vec::new();
    for &(tag, attribute) in &[
        ("img", "src"),
        ("script", "src"),
        ("link", "href"),
        ("source", "src"),
        ("video", "src"),
        ("audio", "src"),
    ] {
        handlers.push(element!(format!("{tag}[{attribute}]"), move |el| {
            if let Some(value) = el.get_attribute(attribute) {
                if let Some(local) = lookup(&value) {
                    el.set_attribute(attribute, &local)?;
                }
            }
            Ok(())
        }));
    }
    for &(tag, attribute) in &[("img", "srcset"), ("source", "srcset")] {
        handlers.push(element!(format!("{tag}[{attribute}]"), move |el| {
            if let Some(value) = el.get_attribute(attribute) {
                let first = assets::srcset_first_candidate(&value);
                if let Some(local) = first.and_then(lookup) {
                    el.set_attribute(attribute, &assets::rewrite_srcset(&value, &local))?;
                }
            }
            Ok(())
        }));
    }

    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(html.as_bytes())?;
    rewriter.end()?;
    // The rewriter only splices valid UTF-8 into valid UTF-8.
    Ok(String::from_utf8(output).expect("rewritten document is UTF-8"))
}
