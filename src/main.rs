use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::ProgressBar;
use std::io::BufRead;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;
use webmirror::{Cli, DownloadResult, Downloader, Fetcher, RunError};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let urls = gather_urls(&cli)?;
    if urls.is_empty() {
        bail!("no valid URLs to download");
    }

    let options = cli
        .run_options()
        .context("failed to resolve the output directory")?;
    let fetcher = Fetcher::new(&cli.user_agent).context("failed to build the HTTP client")?;
    let downloader = Downloader::with_fetcher(options, fetcher);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let spinner = (!cli.json).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_message(format!("downloading {} URL(s)", urls.len()));
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    });

    let outcome = downloader.run(urls, &cancel).await;
    if let Some(bar) = &spinner {
        bar.finish_and_clear();
    }

    match outcome {
        Ok(results) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_summary(&results);
            }
            if results.iter().any(|result| !result.success) {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(RunError::Canceled) => {
            eprintln!("{}", "run canceled".yellow());
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}

/// URLs from the command line, the input file, or stdin, in that order of
/// preference. Lines that do not parse as absolute http(s) URLs are skipped
/// with a warning.
fn gather_urls(cli: &Cli) -> Result<Vec<Url>> {
    let mut raw: Vec<String> = cli.urls.clone();

    if let Some(path) = &cli.input_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        raw.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned),
        );
    }

    if raw.is_empty() {
        for line in std::io::stdin().lock().lines() {
            let line = line.context("failed to read from stdin")?;
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                raw.push(line.to_owned());
            }
        }
    }

    let mut urls = Vec::with_capacity(raw.len());
    for candidate in raw {
        match Url::parse(&candidate) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => urls.push(url),
            _ => warn!("skipping invalid URL: {candidate}"),
        }
    }
    Ok(urls)
}

fn print_summary(results: &[DownloadResult]) {
    for result in results {
        if result.success {
            let path = result
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!("{} {} -> {}", "ok".green(), result.url, path);
        } else {
            let reason = result.error.as_deref().unwrap_or("unknown error");
            println!("{} {} ({})", "failed".red(), result.url, reason);
        }
    }
    let failed = results.iter().filter(|result| !result.success).count();
    let succeeded = results.len() - failed;
    println!(
        "{} downloaded, {} failed",
        succeeded.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );
}
