use anyhow::{Context, bail};
use clap::ArgMatches;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use trawler_core::config::{AppConfig, Backend, expand_path};
use trawler_core::report::{ReportData, ReportFormat, generate_report, save_report};
use trawler_scanner::{ContentClassifier, CrawlPolicy};
use url::Url;

// Helper functions for crawl handler

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(
    url: Option<&Url>,
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        Ok(vec![url.as_str().to_string()])
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file. Blank lines and `#` comments are skipped.
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = Url::parse(line)
        && matches!(url.scheme(), "http" | "https")
    {
        return Some(line.to_string());
    }

    let with_scheme = format!("http://{}", line);
    if let Ok(url) = Url::parse(&with_scheme)
        && url.host_str().is_some_and(|host| !host.contains(' '))
    {
        return Some(with_scheme);
    }

    warn!("Skipping invalid URL '{}'", line);
    None
}

/// Applies `crawl` flags on top of the policy from the config file.
pub fn policy_from_args(base: CrawlPolicy, args: &ArgMatches) -> CrawlPolicy {
    let mut policy = base;
    if let Some(depth) = args.get_one::<usize>("depth") {
        policy.max_depth = *depth;
    }
    if let Some(pages) = args.get_one::<usize>("pages") {
        policy.max_pages = *pages;
    }
    if let Some(delay) = args.get_one::<u64>("delay") {
        policy.request_delay_ms = *delay;
    }
    if args.get_flag("follow-external") {
        policy.follow_external_links = true;
    }
    if args.get_flag("dynamic") {
        policy.use_dynamic_crawling = true;
    }
    if let Some(domains) = args.get_many::<String>("allow-domain") {
        policy.allowed_domains = domains.cloned().collect();
    }
    if let Some(filters) = args.get_many::<String>("filter") {
        policy.url_filters.extend(filters.cloned());
    }
    policy
}

/// Applies `crawl` flags that select and tune the backend.
pub fn apply_crawl_overrides(config: &mut AppConfig, args: &ArgMatches) -> anyhow::Result<()> {
    config.policy = policy_from_args(config.policy.clone(), args);
    if let Some(backend) = args.get_one::<String>("backend") {
        config.crawl.backend = backend.parse::<Backend>()?;
    }
    if let Some(workers) = args.get_one::<usize>("workers") {
        config.crawl.workers = *workers;
    }
    if let Some(program) = args.get_one::<String>("worker-program") {
        config.bridge.program = program.clone();
    }
    if let Some(script) = args.get_one::<PathBuf>("worker-script") {
        config.bridge.script = Some(script.to_string_lossy().into_owned());
    }
    config.validate()?;
    Ok(())
}

/// Classifier with a render sandbox when one is configured and available.
pub async fn build_classifier(config: &AppConfig) -> anyhow::Result<Arc<ContentClassifier>> {
    let timeout = config.policy.js_analysis_timeout();
    if !config.sandbox.enabled {
        return Ok(Arc::new(
            ContentClassifier::new().with_js_analysis_timeout(timeout),
        ));
    }

    #[cfg(feature = "browser")]
    {
        use trawler_scanner::{ChromiumSandbox, JsExecutionAnalyzer, RenderSandbox};

        let sandbox: Arc<dyn RenderSandbox> = Arc::new(
            ChromiumSandbox::launch()
                .await
                .context("Failed to launch the render sandbox")?,
        );
        let analyzer =
            JsExecutionAnalyzer::new(sandbox.clone()).with_thresholds(config.sandbox.thresholds);
        Ok(Arc::new(
            ContentClassifier::with_sandbox(sandbox)
                .with_analyzer(analyzer)
                .with_js_analysis_timeout(timeout),
        ))
    }

    #[cfg(not(feature = "browser"))]
    {
        warn!("Render sandbox requested but trawler was built without the `browser` feature");
        Ok(Arc::new(
            ContentClassifier::new().with_js_analysis_timeout(timeout),
        ))
    }
}

pub fn handle_init(args: &ArgMatches) -> anyhow::Result<()> {
    let path = args
        .get_one::<String>("PATH")
        .context("missing config path")?;
    let force = args.get_flag("force");
    let config_path = expand_path(path);

    AppConfig::write_default(&config_path, force)?;

    println!(
        "{} Config written: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );
    Ok(())
}

pub async fn handle_crawl(
    sub_matches: &ArgMatches,
    config_path: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<()> {
    let url = sub_matches.get_one::<Url>("url");
    let hosts_file = sub_matches.get_one::<PathBuf>("hosts-file");
    let seeds = load_urls_from_source(url, hosts_file).map_err(anyhow::Error::msg)?;

    let mut config = AppConfig::load_or_default(config_path)?;
    apply_crawl_overrides(&mut config, sub_matches)?;

    let format = sub_matches
        .get_one::<String>("format")
        .map(|f| f.parse::<ReportFormat>())
        .transpose()?
        .unwrap_or(ReportFormat::Text);
    let output = sub_matches.get_one::<PathBuf>("output");

    if !quiet {
        println!("\n{} Crawling {} host(s)", "→".blue(), seeds.len());
        println!("Backend: {}", config.crawl.backend);
        println!("Workers: {}", config.crawl.workers);
        println!(
            "Max depth: {}  Max pages: {}",
            limit_label(config.policy.max_depth),
            limit_label(config.policy.max_pages)
        );
        println!(
            "Cross-domain: {}\n",
            if config.policy.follow_external_links {
                "enabled"
            } else {
                "disabled (same domain only)"
            }
        );
    }

    let classifier = build_classifier(&config).await?;
    let mut options = trawler_core::CrawlOptions::new(seeds);
    options.workers = config.crawl.workers;
    options.policy = config.policy.clone();
    options.backend = config.crawl.backend;
    options.bridge = config.bridge.to_bridge_config();
    options.classifier = classifier;
    options.show_progress_bars = !quiet;

    let progress_callback: Option<trawler_core::CrawlProgressCallback> = if quiet {
        None
    } else {
        Some(Arc::new(|msg: String| {
            println!("{}", msg);
        }))
    };

    let summary = trawler_core::execute_crawl(options, progress_callback, None).await?;
    info!(
        "Crawl finished with status {} in {:.1}s",
        summary.status,
        summary.elapsed.as_secs_f64()
    );

    match output {
        Some(path) => {
            let data = ReportData::from_summary(&summary);
            let content = generate_report(&data, format)?;
            save_report(&content, path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!(
                "{} Report saved: {}",
                "✓".green().bold(),
                path.display().to_string().bright_white()
            );
        }
        None => match format {
            ReportFormat::Text => print!(
                "{}",
                trawler_core::generate_crawl_report(&summary.results)
            ),
            other => {
                let data = ReportData::from_summary(&summary);
                print!("{}", generate_report(&data, other)?);
            }
        },
    }

    if summary.results.is_empty() && !summary.errors.is_empty() {
        bail!("Crawl produced no pages ({} errors)", summary.errors.len());
    }
    Ok(())
}

fn limit_label(limit: usize) -> String {
    if limit == 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}
