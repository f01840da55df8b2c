//! Channel page fetching.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::trace;

use crate::error::FetchError;

/// Future returned by [`PageFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<FetchedPage, FetchError>> + Send + 'a>>;

/// A fetched page. Non-success statuses are returned, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Async page fetch interface.
pub trait PageFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

/// Default user agent for page requests.
pub const DEFAULT_USER_AGENT: &str = concat!("handlename/", env!("CARGO_PKG_VERSION"));

/// [`PageFetcher`] backed by `reqwest`.
///
/// Requests carry no cookies and follow redirects.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let response = self.client.get(url).send().await?;
            let status = response.status().as_u16();
            trace!(url, status, "page response");
            if !response.status().is_success() {
                return Ok(FetchedPage {
                    status,
                    body: String::new(),
                });
            }
            let body = response.text().await?;
            Ok(FetchedPage { status, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        let page = |status| FetchedPage {
            status,
            body: String::new(),
        };
        assert!(page(200).is_success());
        assert!(page(204).is_success());
        assert!(!page(304).is_success());
        assert!(!page(404).is_success());
        assert!(!page(503).is_success());
    }

    #[test]
    fn client_builds_with_defaults() {
        assert!(HttpFetcher::new(Duration::from_secs(10), DEFAULT_USER_AGENT).is_ok());
    }
}
