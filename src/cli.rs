use crate::downloader::RunOptions;
use crate::fetch::DEFAULT_USER_AGENT;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "webmirror",
    about = "Download web pages concurrently, optionally mirroring their assets for offline viewing",
    version
)]
pub struct Cli {
    /// URLs to download. When omitted, URLs are read from --input-file or,
    /// failing that, one per line from stdin.
    pub urls: Vec<String>,

    /// Output directory for downloaded files
    #[arg(short, long, default_value = "./mirror")]
    pub output_dir: PathBuf,

    /// Maximum concurrent downloads
    #[arg(short = 'c', long, default_value_t = 8)]
    pub max_concurrent: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Also download each page's assets and rewrite it to render offline
    #[arg(short = 'a', long)]
    pub download_assets: bool,

    /// Allow asset downloads from origins other than the page's own
    #[arg(long)]
    pub third_party: bool,

    /// File with one URL per line; blank lines and lines starting with # are skipped
    #[arg(short = 'i', long)]
    pub input_file: Option<PathBuf>,

    /// Print the results as JSON instead of the human-readable summary
    #[arg(long)]
    pub json: bool,

    /// User-Agent header sent with every request
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,
}

impl Cli {
    /// Engine options for this invocation. `output_root` is made absolute so
    /// the materialized paths are absolute too.
    pub fn run_options(&self) -> std::io::Result<RunOptions> {
        Ok(RunOptions {
            output_root: std::path::absolute(&self.output_dir)?,
            max_concurrency: self.max_concurrent,
            request_timeout: Duration::from_secs(self.timeout),
            download_assets: self.download_assets,
            include_third_party_assets: self.third_party,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["webmirror", "https://example.com/"]);
        assert_eq!(cli.urls, vec!["https://example.com/"]);
        assert_eq!(cli.max_concurrent, 8);
        assert_eq!(cli.timeout, 30);
        assert!(!cli.download_assets);
        assert!(!cli.third_party);
        assert!(!cli.json);
    }

    #[test]
    fn test_mirror_flags() {
        let cli = Cli::parse_from([
            "webmirror",
            "-a",
            "--third-party",
            "-c",
            "4",
            "--timeout",
            "5",
            "https://example.com/",
        ]);
        let options = cli.run_options().unwrap();
        assert!(options.download_assets);
        assert!(options.include_third_party_assets);
        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert!(options.output_root.is_absolute());
    }
}
