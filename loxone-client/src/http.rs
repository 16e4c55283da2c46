//! HTTP bootstrap collaborator.
//!
//! Before the socket opens, the auth engine needs the miniserver's API
//! info and RSA public key. Both travel over plain HTTP and are fetched
//! through this seam so tests can stub them.

use async_trait::async_trait;

use loxone_types::{LoxoneEndpoint, LoxoneMessage, command::Command};

use crate::codec;
use crate::Error;

/// Synchronous-in-spirit fetch of one command over HTTP.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetches `command` and parses the control message it answers with.
    async fn get(&self, command: &Command) -> Result<LoxoneMessage, Error>;
}

/// [`HttpFetcher`] backed by a shared reqwest client.
pub struct ReqwestFetcher {
    endpoint: LoxoneEndpoint,
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Creates a fetcher for the given miniserver.
    pub fn new(endpoint: LoxoneEndpoint) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, command: &Command) -> Result<LoxoneMessage, Error> {
        let url = self.endpoint.http_url(command.command());
        tracing::trace!("> bootstrap fetch {url}");
        let text = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::Bootstrap(err.to_string()))?
            .text()
            .await
            .map_err(|err| Error::Bootstrap(err.to_string()))?;
        Ok(codec::parse_message(&text)?)
    }
}
