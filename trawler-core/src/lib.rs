pub mod bridge;
pub mod config;
pub mod crawl;
pub mod error;
pub mod manager;
pub mod report;

pub use bridge::{BridgeConfig, ProcessBridge, WorkerConfig};
pub use config::{AppConfig, Backend};
pub use crawl::{
    CrawlOptions, CrawlProgressCallback, CrawlResultCallback, CrawlSummary, execute_crawl,
    generate_crawl_report,
};
pub use error::{CoreError, Result};
pub use manager::{CrawlManager, SchedulerFactory};
pub use report::{ReportData, ReportFormat};

use colored::Colorize;

pub fn print_banner() {
    let banner = r#"
  _                       _
 | |_ _ __ __ ___      __| | ___ _ __
 | __| '__/ _` \ \ /\ / /| |/ _ \ '__|
 | |_| | | (_| |\ V  V / | |  __/ |
  \__|_|  \__,_| \_/\_/  |_|\___|_|
"#;
    println!("{}", banner.cyan());
    println!(
        "  {} {}\n",
        "trawler".bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
}
