//! Crawl policy and URL normalization.

use crate::error::{Result, ScanError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// User-facing crawl limits and URL rules.
///
/// `max_depth` and `max_pages` treat `0` as unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlPolicy {
    pub max_depth: usize,
    pub max_pages: usize,
    pub request_delay_ms: u64,
    pub follow_external_links: bool,
    pub allowed_domains: Vec<String>,
    /// Block-list: a URL matching any of these regexes is dropped.
    pub url_filters: Vec<String>,
    pub use_dynamic_crawling: bool,
    pub page_load_timeout_ms: u64,
    pub js_analysis_timeout_ms: u64,
}

impl Default for CrawlPolicy {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_pages: 100,
            request_delay_ms: 1000,
            follow_external_links: false,
            allowed_domains: Vec::new(),
            url_filters: Vec::new(),
            use_dynamic_crawling: false,
            page_load_timeout_ms: 30_000,
            js_analysis_timeout_ms: 5_000,
        }
    }
}

impl CrawlPolicy {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_request_delay_ms(mut self, delay: u64) -> Self {
        self.request_delay_ms = delay;
        self
    }

    pub fn with_follow_external_links(mut self, follow: bool) -> Self {
        self.follow_external_links = follow;
        self
    }

    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    pub fn with_url_filters(mut self, filters: Vec<String>) -> Self {
        self.url_filters = filters;
        self
    }

    pub fn with_dynamic_crawling(mut self, enabled: bool) -> Self {
        self.use_dynamic_crawling = enabled;
        self
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn js_analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.js_analysis_timeout_ms)
    }

    /// Compiles the URL filters. An invalid regex rejects the whole policy.
    pub fn compile(&self) -> Result<UrlPolicy> {
        let filters = self
            .url_filters
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ScanError::InvalidPolicy(format!("bad url filter '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(UrlPolicy {
            follow_external_links: self.follow_external_links,
            allowed_domains: self
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            filters,
        })
    }
}

/// The URL-acceptance half of a [`CrawlPolicy`], with filters compiled.
#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    follow_external_links: bool,
    allowed_domains: Vec<String>,
    filters: Vec<Regex>,
}

impl UrlPolicy {
    /// Accepts everything that resolves to an http(s) URL.
    pub fn permissive() -> Self {
        Self {
            follow_external_links: true,
            ..Self::default()
        }
    }

    fn is_allowed_domain(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_lowercase();
        self.allowed_domains
            .iter()
            .any(|domain| host.ends_with(domain.as_str()))
    }

    fn is_filtered(&self, url: &str) -> bool {
        self.filters.iter().any(|re| re.is_match(url))
    }
}

/// Resolves `candidate` against `base` and applies the policy.
///
/// Returns `None` when the URL should be dropped. An empty `base` skips the
/// same-host check, which is how seed URLs are admitted.
pub fn normalize_url(base: &str, candidate: &str, policy: &UrlPolicy) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty()
        || candidate.starts_with('#')
        || candidate.starts_with("javascript:")
        || candidate.starts_with("mailto:")
        || candidate.starts_with("tel:")
        || candidate.starts_with("data:")
    {
        return None;
    }

    let base_url = if base.is_empty() {
        None
    } else {
        Some(Url::parse(base).ok()?)
    };

    let mut url = match Url::parse(candidate) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base_url.as_ref()?.join(candidate).ok()?,
        Err(_) => return None,
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    let host = url.host_str()?.to_string();

    if !policy.follow_external_links
        && let Some(base_url) = &base_url
        && base_url.host_str() != Some(host.as_str())
    {
        return None;
    }

    if !policy.is_allowed_domain(&host) {
        return None;
    }

    let normalized = url.to_string();
    if policy.is_filtered(&normalized) {
        return None;
    }

    Some(normalized)
}
