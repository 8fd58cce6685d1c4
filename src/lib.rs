pub mod assets;
pub mod cli;
pub mod css;
pub mod downloader;
pub mod fetch;
pub mod mirror;
pub mod paths;
pub mod pool;
pub mod storage;

// Re-export the main types for convenience
pub use cli::Cli;
pub use downloader::{DownloadResult, Downloader, RunError, RunOptions};
pub use fetch::Fetcher;
pub use mirror::{DownloadedAsset, MirrorRunContext};
pub use paths::output_path;
