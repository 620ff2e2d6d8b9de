pub mod commands;
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{load_urls_from_file, load_urls_from_source, parse_url_line};

// Re-export crawl functionality from trawler-core
pub use trawler_core::crawl::{
    CrawlOptions, CrawlProgressCallback, execute_crawl, extract_url_path, generate_crawl_report,
};

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
