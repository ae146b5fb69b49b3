//! Remote fetching.
//!
//! The resolver only needs "bytes for a URL, or a failure", so HTTP sits behind
//! the [`Fetcher`] trait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::error::ResolveError;

/// Fetches the complete body of a URL.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `url`, failing on transport errors, non-success status or timeout.
    ///
    /// Implementations must return the whole body or an error, never a prefix.
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, ResolveError>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, ResolveError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ResolveError::Network {
                url: String::new(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, ResolveError> {
        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| network_error(url, e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ResolveError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await.map_err(|e| network_error(url, e))?;
            Ok(body.to_vec())
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }
}

fn network_error(url: &Url, err: reqwest::Error) -> ResolveError {
    ResolveError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}
