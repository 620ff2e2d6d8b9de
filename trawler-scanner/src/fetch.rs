use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;

pub const USER_AGENT: &str = concat!("Trawler/", env!("CARGO_PKG_VERSION"));

/// Raw HTTP response for one URL.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub response_time: Duration,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| ct.to_lowercase().contains("text/html"))
            .unwrap_or(false)
    }
}

/// Retrieves pages for the frontier.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Plain HTTP(S) fetcher on a pooled reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        debug!("Fetching {}", url);

        let start = Instant::now();
        let response = self.client.get(url).send().await?.error_for_status()?;
        let response_time = start.elapsed();

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await?;

        debug!(
            "Fetched {} ({}) in {:?}, {} bytes",
            url,
            status,
            response_time,
            body.len()
        );

        Ok(FetchedPage {
            url: url.to_string(),
            status,
            content_type,
            body,
            response_time,
        })
    }
}
