use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};
use trawler::commands::command_argument_builder;
use trawler::extract_url_path;
use trawler::handlers::*;
use trawler_core::config::{AppConfig, Backend};
use trawler_scanner::CrawlPolicy;
use url::Url;

fn crawl_matches(args: &[&str]) -> clap::ArgMatches {
    let mut argv = vec!["trawler", "crawl"];
    argv.extend_from_slice(args);
    let matches = command_argument_builder()
        .try_get_matches_from(argv)
        .unwrap();
    matches.subcommand_matches("crawl").unwrap().clone()
}

// ============================================================================
// URL loading
// ============================================================================

#[test]
fn test_parse_url_line_with_scheme() {
    let result = parse_url_line("https://example.com");
    assert_eq!(result, Some("https://example.com".to_string()));
}

#[test]
fn test_parse_url_line_without_scheme() {
    let result = parse_url_line("example.com");
    assert_eq!(result, Some("http://example.com".to_string()));
}

#[test]
fn test_parse_url_line_host_with_port() {
    let result = parse_url_line("localhost:8080");
    assert_eq!(result, Some("http://localhost:8080".to_string()));
}

#[test]
fn test_parse_url_line_invalid() {
    let result = parse_url_line("not a valid url!!!");
    assert_eq!(result, None);
}

#[test]
fn test_extract_url_path() {
    assert_eq!(
        extract_url_path("https://example.com/api/users"),
        "/api/users"
    );
    assert_eq!(extract_url_path("https://example.com/"), "/");
    assert_eq!(extract_url_path("https://example.com"), "/");
}

#[test]
fn test_load_urls_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "https://example.com")?;
    writeln!(temp_file, "httpbin.org")?;
    writeln!(temp_file)?; // Empty line
    writeln!(temp_file, "# staging hosts")?;
    writeln!(temp_file, "  https://api.example.com  ")?;

    let path = PathBuf::from(temp_file.path());
    let urls = load_urls_from_file(&path)?;

    assert_eq!(urls.len(), 3);
    assert_eq!(urls[0], "https://example.com");
    assert_eq!(urls[1], "http://httpbin.org");
    assert_eq!(urls[2], "https://api.example.com");

    Ok(())
}

#[test]
fn test_load_urls_from_file_empty() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file).unwrap();
    writeln!(temp_file, "   ").unwrap();

    let path = PathBuf::from(temp_file.path());
    let result = load_urls_from_file(&path);

    assert!(result.is_err());
    assert!(result.unwrap_err().contains("No valid URLs"));
}

#[test]
fn test_load_urls_from_file_missing() {
    let result = load_urls_from_file(&PathBuf::from("/nonexistent/hosts.txt"));
    assert!(result.unwrap_err().contains("Failed to read hosts file"));
}

#[test]
fn test_load_urls_from_source_single_url() {
    let url = Url::parse("https://example.com").unwrap();
    let result = load_urls_from_source(Some(&url), None).unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0], "https://example.com/");
}

#[test]
fn test_load_urls_from_source_no_input() {
    let result = load_urls_from_source(None, None);
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .contains("Either --url or --hosts-file must be provided")
    );
}

// ============================================================================
// Command line
// ============================================================================

#[test]
fn test_url_conflicts_with_hosts_file() {
    let result = command_argument_builder().try_get_matches_from([
        "trawler",
        "crawl",
        "-u",
        "http://example.com",
        "-H",
        "hosts.txt",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_rejects_unknown_backend() {
    let result = command_argument_builder().try_get_matches_from([
        "trawler",
        "crawl",
        "-u",
        "http://example.com",
        "--backend",
        "browser",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_policy_from_args_overrides_defaults() {
    let args = crawl_matches(&[
        "-u",
        "http://example.com",
        "-d",
        "5",
        "-p",
        "0",
        "--delay",
        "250",
        "--follow-external",
        "--allow-domain",
        "example.com",
        "--allow-domain",
        "cdn.example.com",
        "--filter",
        r"\.pdf$",
        "--dynamic",
    ]);

    let policy = policy_from_args(CrawlPolicy::default(), &args);

    assert_eq!(policy.max_depth, 5);
    assert_eq!(policy.max_pages, 0);
    assert_eq!(policy.request_delay_ms, 250);
    assert!(policy.follow_external_links);
    assert!(policy.use_dynamic_crawling);
    assert_eq!(
        policy.allowed_domains,
        vec!["example.com".to_string(), "cdn.example.com".to_string()]
    );
    assert_eq!(policy.url_filters, vec![r"\.pdf$".to_string()]);
}

#[test]
fn test_policy_from_args_keeps_config_values() {
    let args = crawl_matches(&["-u", "http://example.com"]);
    let base = CrawlPolicy::default()
        .with_max_depth(7)
        .with_url_filters(vec!["logout".to_string()]);

    let policy = policy_from_args(base.clone(), &args);
    assert_eq!(policy, base);
}

#[test]
fn test_apply_crawl_overrides_selects_bridge() {
    let args = crawl_matches(&[
        "-u",
        "http://example.com",
        "--backend",
        "bridge",
        "-w",
        "3",
        "--worker-program",
        "python3.12",
        "--worker-script",
        "/opt/worker/crawl.py",
    ]);

    let mut config = AppConfig::default();
    apply_crawl_overrides(&mut config, &args).unwrap();

    assert_eq!(config.crawl.backend, Backend::Bridge);
    assert_eq!(config.crawl.workers, 3);
    assert_eq!(config.bridge.program, "python3.12");
    assert_eq!(config.bridge.script.as_deref(), Some("/opt/worker/crawl.py"));
}

#[test]
fn test_apply_crawl_overrides_rejects_bad_filter() {
    let args = crawl_matches(&["-u", "http://example.com", "--filter", "(unclosed"]);
    let mut config = AppConfig::default();
    assert!(apply_crawl_overrides(&mut config, &args).is_err());
}

#[test]
fn test_apply_crawl_overrides_rejects_zero_workers() {
    let args = crawl_matches(&["-u", "http://example.com", "-w", "0"]);
    let mut config = AppConfig::default();
    assert!(apply_crawl_overrides(&mut config, &args).is_err());
}

// ============================================================================
// Init
// ============================================================================

#[test]
fn test_handle_init_writes_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let path_arg = path.to_string_lossy().into_owned();

    let matches = command_argument_builder()
        .try_get_matches_from(["trawler", "init", path_arg.as_str()])
        .unwrap();
    handle_init(matches.subcommand_matches("init").unwrap()).unwrap();

    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config, AppConfig::default());

    // A second run without --force refuses to overwrite
    let again = command_argument_builder()
        .try_get_matches_from(["trawler", "init", path_arg.as_str()])
        .unwrap();
    assert!(handle_init(again.subcommand_matches("init").unwrap()).is_err());

    let forced = command_argument_builder()
        .try_get_matches_from(["trawler", "init", path_arg.as_str(), "--force"])
        .unwrap();
    assert!(handle_init(forced.subcommand_matches("init").unwrap()).is_ok());
}
