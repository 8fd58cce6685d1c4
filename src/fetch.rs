use reqwest::{Client, ClientBuilder, Response};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default identity sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("webmirror/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Canceled")]
    Canceled,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Thin wrapper around a shared HTTP client. Responses come back with the
/// headers parsed and the body still on the wire; status codes are the
/// caller's business.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> Result<Response, FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Canceled),
            sent = self.client.get(url.clone()).send() => Ok(sent?),
        }
    }
}
