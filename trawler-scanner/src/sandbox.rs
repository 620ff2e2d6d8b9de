//! Headless page-rendering capability.
//!
//! The crawler never renders pages itself: it drives an implementation of
//! [`RenderSandbox`]. With the `browser` feature, [`ChromiumSandbox`] provides
//! one on top of headless Chromium.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Something that can load a URL, run its scripts and hand back the page.
#[async_trait]
pub trait RenderSandbox: Send + Sync {
    /// Loads `url` and resolves once loading finished, or fails with
    /// [`crate::ScanError::RenderTimeout`] when `timeout` elapses first.
    async fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn RenderedPage>>;
}

/// A loaded page inside the sandbox. Every call is one round-trip.
#[async_trait]
pub trait RenderedPage: Send + Sync {
    /// Evaluates a script in the page and returns its JSON-converted value.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    /// Serialized DOM of the page in its current state.
    async fn html(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    async fn close(self: Box<Self>);
}

#[cfg(feature = "browser")]
pub use chromium::ChromiumSandbox;

#[cfg(feature = "browser")]
mod chromium {
    use super::{RenderSandbox, RenderedPage};
    use crate::error::{Result, ScanError};
    use async_trait::async_trait;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    /// Render sandbox backed by a headless Chromium instance.
    pub struct ChromiumSandbox {
        browser: Browser,
        handler: JoinHandle<()>,
    }

    impl ChromiumSandbox {
        pub async fn launch() -> Result<Self> {
            let config = BrowserConfig::builder()
                .no_sandbox()
                .window_size(1920, 1080)
                .arg("--disable-gpu")
                .arg("--disable-dev-shm-usage")
                .build()
                .map_err(|e| ScanError::RenderError(format!("browser config error: {}", e)))?;

            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| ScanError::RenderError(e.to_string()))?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        debug!("Browser handler event error: {}", e);
                    }
                }
            });

            info!("Chromium render sandbox launched");
            Ok(Self { browser, handler })
        }
    }

    impl Drop for ChromiumSandbox {
        fn drop(&mut self) {
            self.handler.abort();
        }
    }

    #[async_trait]
    impl RenderSandbox for ChromiumSandbox {
        async fn open(&self, url: &str, timeout: Duration) -> Result<Box<dyn RenderedPage>> {
            let load = async {
                let page = self.browser.new_page(url).await?;
                page.wait_for_navigation().await?;
                Ok::<Page, chromiumoxide::error::CdpError>(page)
            };

            match tokio::time::timeout(timeout, load).await {
                Ok(Ok(page)) => Ok(Box::new(ChromiumPage { page })),
                Ok(Err(e)) => Err(ScanError::RenderError(e.to_string())),
                Err(_) => {
                    warn!("Page load timeout for {}", url);
                    Err(ScanError::RenderTimeout(timeout.as_millis() as u64))
                }
            }
        }
    }

    struct ChromiumPage {
        page: Page,
    }

    #[async_trait]
    impl RenderedPage for ChromiumPage {
        async fn evaluate(&self, script: &str) -> Result<Value> {
            let evaluation = self
                .page
                .evaluate(script)
                .await
                .map_err(|e| ScanError::RenderError(e.to_string()))?;
            Ok(evaluation.value().cloned().unwrap_or(Value::Null))
        }

        async fn html(&self) -> Result<String> {
            self.page
                .content()
                .await
                .map_err(|e| ScanError::RenderError(e.to_string()))
        }

        async fn title(&self) -> Result<String> {
            let title = self
                .page
                .get_title()
                .await
                .map_err(|e| ScanError::RenderError(e.to_string()))?;
            Ok(title.unwrap_or_default())
        }

        async fn close(self: Box<Self>) {
            if let Err(e) = self.page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }
    }
}
