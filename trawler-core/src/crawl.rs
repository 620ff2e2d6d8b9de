use crate::bridge::{BridgeConfig, ProcessBridge};
use crate::config::Backend;
use crate::error::Result;
use crate::manager::{CrawlManager, SchedulerFactory};
use chrono::{DateTime, Utc};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use trawler_scanner::{
    ContentClassifier, CrawlEvent, CrawlPolicy, CrawlStatus, Frontier, HttpFetcher, PageFetcher,
    PageResult, Scheduler, event_channel,
};
use url::Url;

/// Options for configuring a crawl operation
pub struct CrawlOptions {
    pub seeds: Vec<String>,
    pub workers: usize,
    pub policy: CrawlPolicy,
    pub backend: Backend,
    pub bridge: BridgeConfig,
    pub classifier: Arc<ContentClassifier>,
    pub show_progress_bars: bool,
}

impl CrawlOptions {
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            workers: 10,
            policy: CrawlPolicy::default(),
            backend: Backend::Frontier,
            bridge: BridgeConfig::default(),
            classifier: Arc::new(ContentClassifier::new()),
            show_progress_bars: false,
        }
    }
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback for reporting individual crawl results as they come in
pub type CrawlResultCallback = Arc<dyn Fn(&PageResult) + Send + Sync>;

/// What a finished (or interrupted) crawl produced.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub seeds: Vec<String>,
    pub status: CrawlStatus,
    pub results: Vec<PageResult>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Builds per-seed schedulers for the chosen backend.
pub fn scheduler_factory(
    backend: Backend,
    bridge: BridgeConfig,
    classifier: Arc<ContentClassifier>,
) -> Result<SchedulerFactory> {
    let factory: SchedulerFactory = match backend {
        Backend::Frontier => {
            let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new()?);
            Arc::new(move |_slot, events| {
                Box::new(Frontier::new(fetcher.clone(), events).with_classifier(classifier.clone()))
                    as Box<dyn Scheduler>
            })
        }
        Backend::Bridge => Arc::new(move |slot, events| {
            Box::new(ProcessBridge::new(bridge.for_slot(slot), events)) as Box<dyn Scheduler>
        }),
    };
    Ok(factory)
}

/// Extract the path component from a URL
pub fn extract_url_path(url: &str) -> String {
    Url::parse(url)
        .ok()
        .map(|u| {
            let path = u.path().to_string();
            if path.is_empty() || path == "/" {
                "/".to_string()
            } else {
                path
            }
        })
        .unwrap_or_else(|| url.to_string())
}

/// Execute a crawl with the given options.
/// Ctrl-C stops the crawl and keeps whatever was gathered.
pub async fn execute_crawl(
    options: CrawlOptions,
    progress_callback: Option<CrawlProgressCallback>,
    result_callback: Option<CrawlResultCallback>,
) -> Result<CrawlSummary> {
    let CrawlOptions {
        seeds,
        workers,
        policy,
        backend,
        bridge,
        classifier,
        show_progress_bars,
    } = options;

    let factory = scheduler_factory(backend, bridge, classifier)?;
    let (tx, mut rx) = event_channel();
    let mut manager = CrawlManager::new(factory, workers, tx);

    let started_at = Utc::now();
    let clock = Instant::now();
    info!("Crawling {} seed(s) with the {} backend", seeds.len(), backend);
    manager.start(&seeds, policy).await?;

    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("Starting crawl...");
        Some(pb)
    } else {
        None
    };

    let mut errors = Vec::new();
    let mut pages = 0usize;
    let mut seeds_done = (0usize, seeds.len());

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(CrawlEvent::ResultReady(result)) => {
                    pages += 1;
                    if let Some(ref cb) = result_callback {
                        cb(&result);
                    }
                }
                Some(CrawlEvent::Progress { crawled, total }) => {
                    seeds_done = (crawled, total);
                    if let Some(ref callback) = progress_callback
                        && total > 1
                    {
                        callback(format!("Finished host {}/{}", crawled, total));
                    }
                }
                Some(CrawlEvent::Error(message)) => {
                    if let Some(ref callback) = progress_callback {
                        callback(format!("[!]  {}", message));
                    }
                    errors.push(message);
                }
                Some(CrawlEvent::Completed) | None => break,
                Some(CrawlEvent::StatusChanged(status)) if status.is_terminal() => {
                    if status != CrawlStatus::Completed {
                        break;
                    }
                }
                Some(CrawlEvent::StatusChanged(_)) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping crawl");
                if let Some(ref pb) = progress_bar {
                    pb.set_message("Stopping...");
                }
                manager.stop().await;
                break;
            }
        }

        if let Some(ref pb) = progress_bar {
            pb.set_message(format!(
                "Crawling... {} pages, {}/{} hosts done",
                pages, seeds_done.0, seeds_done.1
            ));
        }
    }

    let results = manager.results().await;
    let status = manager.status();

    if let Some(ref pb) = progress_bar {
        pb.finish_with_message(format!("Crawl {}! {} pages crawled", status, results.len()));
    }

    Ok(CrawlSummary {
        seeds,
        status,
        results,
        errors,
        started_at,
        elapsed: clock.elapsed(),
    })
}

/// Group results by host, hosts and paths in sorted order
pub fn group_by_host(results: &[PageResult]) -> BTreeMap<String, Vec<&PageResult>> {
    let mut by_host: BTreeMap<String, Vec<&PageResult>> = BTreeMap::new();
    for result in results {
        if let Ok(url) = Url::parse(&result.url)
            && let Some(host) = url.host_str()
        {
            by_host.entry(host.to_string()).or_default().push(result);
        }
    }
    for host_results in by_host.values_mut() {
        host_results.sort_by(|a, b| a.url.cmp(&b.url));
    }
    by_host
}

/// Generate a crawl report from results
pub fn generate_crawl_report(results: &[PageResult]) -> String {
    let mut report = String::new();
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Pages crawled: {}\n", results.len()));

    let dynamic = results.iter().filter(|r| r.is_dynamic()).count();
    report.push_str(&format!("  Static pages: {}\n", results.len() - dynamic));
    report.push_str(&format!("  Dynamic pages: {}\n", dynamic));

    let total_links: usize = results.iter().map(|r| r.outbound_links.len()).sum();
    report.push_str(&format!("  Total links found: {}\n", total_links));

    report.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");

    for (host, host_results) in group_by_host(results) {
        report.push_str(&format!("## {}\n", host));
        report.push_str(&format!("  {} pages found\n\n", host_results.len()));

        for result in host_results {
            let path = extract_url_path(&result.url);
            let mode = if result.is_dynamic() {
                "dynamic".magenta()
            } else {
                "static ".green()
            };

            let mut line = format!("  {} {}", mode, path);
            if !result.title.is_empty() {
                line.push_str(&format!(" {}", result.title.bright_black()));
            }

            report.push_str(&line);
            report.push('\n');
        }
        report.push('\n');
    }

    report
}
