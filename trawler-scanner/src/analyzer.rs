//! Runtime JavaScript probe.
//!
//! Used when static heuristics cannot decide whether a page needs rendering:
//! the page is loaded in the render sandbox, instrumented, observed for a
//! while and scored on what its scripts actually did.

use crate::sandbox::{RenderSandbox, RenderedPage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Installs counters on DOM mutation, XHR/fetch, listener, timer and storage
/// entry points. Idempotent per page.
const INSTRUMENTATION_SCRIPT: &str = r#"
(() => {
  if (window.__trawlerProbe) { return true; }
  const probe = {
    mutations: 0, ajax: 0, listeners: 0, timers: 0, storage: 0, requests: []
  };
  window.__trawlerProbe = probe;

  new MutationObserver(records => { probe.mutations += records.length; })
    .observe(document, { childList: true, subtree: true, attributes: true, characterData: true });

  const xhrOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    probe.ajax += 1;
    probe.requests.push({ kind: 'xhr', method: String(method), url: String(url) });
    return xhrOpen.apply(this, arguments);
  };
  if (window.fetch) {
    const nativeFetch = window.fetch;
    window.fetch = function (input, init) {
      probe.ajax += 1;
      const url = typeof input === 'string' ? input : (input && input.url) || '';
      probe.requests.push({ kind: 'fetch', method: (init && init.method) || 'GET', url: url });
      return nativeFetch.apply(this, arguments);
    };
  }

  const addListener = EventTarget.prototype.addEventListener;
  EventTarget.prototype.addEventListener = function () {
    probe.listeners += 1;
    return addListener.apply(this, arguments);
  };

  for (const name of ['setTimeout', 'setInterval']) {
    const original = window[name];
    window[name] = function () {
      probe.timers += 1;
      return original.apply(this, arguments);
    };
  }

  for (const name of ['getItem', 'setItem', 'removeItem']) {
    const original = Storage.prototype[name];
    Storage.prototype[name] = function () {
      probe.storage += 1;
      return original.apply(this, arguments);
    };
  }

  if (window.PerformanceObserver) {
    try {
      new PerformanceObserver(list => {
        for (const entry of list.getEntries()) {
          if (['fetch', 'xmlhttprequest', 'beacon', 'script'].includes(entry.initiatorType)) {
            probe.requests.push({ kind: entry.initiatorType, url: entry.name, duration: entry.duration });
          }
        }
      }).observe({ entryTypes: ['resource'] });
    } catch (e) {}
  }
  return true;
})()
"#;

const SNAPSHOT_SCRIPT: &str = "document.documentElement ? document.documentElement.outerHTML : ''";

/// Limits above which observed activity counts as dynamic behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicThresholds {
    pub change_degree: f64,
    pub dom_mutations: u64,
    pub ajax_requests: u64,
    pub timers: u64,
}

impl Default for DynamicThresholds {
    fn default() -> Self {
        Self {
            change_degree: 0.1,
            dom_mutations: 5,
            ajax_requests: 0,
            timers: 3,
        }
    }
}

/// What the probe observed on one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsExecutionSample {
    pub dom_mutation_count: u64,
    pub ajax_request_count: u64,
    pub event_listener_count: u64,
    pub timer_count: u64,
    pub storage_access_count: u64,
    pub change_degree: f64,
    pub network_requests: Vec<Value>,
    pub has_dynamic_content: bool,
}

impl JsExecutionSample {
    /// Any single signal over its threshold is enough.
    pub fn exceeds(&self, thresholds: &DynamicThresholds) -> bool {
        self.change_degree > thresholds.change_degree
            || self.dom_mutation_count > thresholds.dom_mutations
            || self.ajax_request_count > thresholds.ajax_requests
            || self.timer_count > thresholds.timers
    }
}

/// Loads pages in a sandbox and scores their script activity.
pub struct JsExecutionAnalyzer {
    sandbox: Arc<dyn RenderSandbox>,
    thresholds: DynamicThresholds,
}

impl JsExecutionAnalyzer {
    pub fn new(sandbox: Arc<dyn RenderSandbox>) -> Self {
        Self {
            sandbox,
            thresholds: DynamicThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: DynamicThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Loads `url` and samples its scripts. A page that cannot be loaded within `timeout` yields a
    /// sample with `has_dynamic_content == false`.
    pub async fn analyze(&self, url: &str, timeout: Duration) -> JsExecutionSample {
        info!("Analyzing JavaScript execution for {}", url);

        let page = match self.sandbox.open(url, timeout).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to load page for JavaScript analysis: {} ({})", url, e);
                return JsExecutionSample::default();
            }
        };

        let mut sample = self.observe(page.as_ref(), timeout / 2).await;
        page.close().await;

        sample.has_dynamic_content = sample.exceeds(&self.thresholds);
        info!(
            "JavaScript analysis for {} done: dynamic = {} (mutations {}, ajax {}, timers {}, change {:.3})",
            url,
            sample.has_dynamic_content,
            sample.dom_mutation_count,
            sample.ajax_request_count,
            sample.timer_count,
            sample.change_degree
        );
        sample
    }

    async fn observe(&self, page: &dyn RenderedPage, window: Duration) -> JsExecutionSample {
        if let Err(e) = page.evaluate(INSTRUMENTATION_SCRIPT).await {
            warn!("Failed to inject instrumentation: {}", e);
        } else {
            debug!("Instrumentation injected");
        }

        let before = snapshot(page).await;
        tokio::time::sleep(window).await;
        let after = snapshot(page).await;

        let mut sample = JsExecutionSample {
            change_degree: compare_snapshots(&before, &after),
            ..JsExecutionSample::default()
        };

        // Each read depends on the page state left by the previous one.
        sample.dom_mutation_count = read_counter(page, "mutations").await;
        sample.ajax_request_count = read_counter(page, "ajax").await;
        sample.event_listener_count = read_counter(page, "listeners").await;
        sample.timer_count = read_counter(page, "timers").await;
        sample.storage_access_count = read_counter(page, "storage").await;
        sample.network_requests = match page
            .evaluate("window.__trawlerProbe ? window.__trawlerProbe.requests : []")
            .await
        {
            Ok(Value::Array(requests)) => requests,
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("Failed to read network requests: {}", e);
                Vec::new()
            }
        };

        sample
    }
}

async fn snapshot(page: &dyn RenderedPage) -> String {
    match page.evaluate(SNAPSHOT_SCRIPT).await {
        Ok(Value::String(html)) => html,
        Ok(_) => String::new(),
        Err(e) => {
            debug!("Snapshot failed: {}", e);
            String::new()
        }
    }
}

async fn read_counter(page: &dyn RenderedPage, counter: &str) -> u64 {
    let script = format!(
        "window.__trawlerProbe ? window.__trawlerProbe.{} : 0",
        counter
    );
    match page.evaluate(&script).await {
        Ok(value) => value.as_u64().unwrap_or(0),
        Err(e) => {
            debug!("Failed to read counter {}: {}", counter, e);
            0
        }
    }
}

/// Degree of change between two DOM snapshots, in `[0, 1]`.
///
/// Average of the relative length delta and the share of differing
/// characters over the common prefix length.
pub fn compare_snapshots(before: &str, after: &str) -> f64 {
    if before == after {
        return 0.0;
    }

    let before: Vec<char> = before.chars().collect();
    let after: Vec<char> = after.chars().collect();

    let length_delta = if before.is_empty() {
        1.0
    } else {
        before.len().abs_diff(after.len()) as f64 / before.len() as f64
    };

    let common = before.len().min(after.len());
    let content_delta = if common == 0 {
        1.0
    } else {
        let differing = before
            .iter()
            .zip(after.iter())
            .filter(|(a, b)| a != b)
            .count();
        differing as f64 / common as f64
    };

    let degree = ((length_delta + content_delta) / 2.0).min(1.0);
    debug!(
        "Snapshot comparison - length delta: {:.3}, content delta: {:.3}, degree: {:.3}",
        length_delta, content_delta, degree
    );
    degree
}
