// Report generation from crawl results

use crate::crawl::{CrawlSummary, extract_url_path, group_by_host};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use trawler_scanner::PageResult;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";
const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            _ => Err(CoreError::ConfigError(format!(
                "Invalid report format: {}. Use text, json or markdown",
                s
            ))),
        }
    }
}

impl ReportFormat {
    /// Infers the format from a file extension, defaulting to text.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .unwrap_or(ReportFormat::Text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    pub seeds: Vec<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub pages: Vec<PageResult>,
    pub errors: Vec<String>,
}

impl ReportData {
    pub fn from_summary(summary: &CrawlSummary) -> Self {
        Self {
            seeds: summary.seeds.clone(),
            status: summary.status.to_string(),
            started_at: summary.started_at,
            duration_seconds: summary.elapsed.as_secs_f64(),
            pages: summary.results.clone(),
            errors: summary.errors.clone(),
        }
    }

    fn dynamic_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_dynamic()).count()
    }

    fn format_targets(&self) -> String {
        match self.seeds.as_slice() {
            [] => "None".to_string(),
            [single] => single.clone(),
            many => format!("{} URLs", many.len()),
        }
    }

    fn status_label(&self) -> &str {
        match self.status.as_str() {
            "completed" => "Completed",
            "idle" => "Stopped",
            "error" => "Failed",
            "running" | "paused" => "Incomplete",
            _ => "Unknown",
        }
    }
}

pub fn generate_report(data: &ReportData, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(generate_text_report(data)),
        ReportFormat::Json => Ok(generate_json_report(data)?),
        ReportFormat::Markdown => Ok(generate_markdown_report(data)),
    }
}

pub fn generate_text_report(data: &ReportData) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                          TRAWLER CRAWL REPORT\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Status:        {}\n", data.status_label()));
    report.push_str(&format!(
        "Crawl Date:    {}\n",
        data.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("Duration:      {:.1} seconds\n", data.duration_seconds));
    report.push_str(&format!("Targets:       {}\n", data.format_targets()));
    report.push_str(&format!("Pages Found:   {}\n", data.pages.len()));
    report.push_str(&format!(
        "Dynamic Pages: {}\n",
        data.dynamic_pages()
    ));
    report.push_str(&format!("Errors:        {}\n\n", data.errors.len()));

    report.push_str(RULE);
    report.push_str("PAGES\n");
    report.push_str(RULE);
    report.push('\n');

    if data.pages.is_empty() {
        report.push_str("  (none)\n\n");
    }

    for (host, pages) in group_by_host(&data.pages) {
        report.push_str(&format!("{}  ({} pages)\n", host, pages.len()));
        for (i, page) in pages.iter().enumerate() {
            let prefix = if i == pages.len() - 1 {
                "└── "
            } else {
                "├── "
            };
            let mode = if page.is_dynamic() { "dyn" } else { "static" };
            report.push_str(&format!(
                "{}{}  [{}] {} links\n",
                prefix,
                extract_url_path(&page.url),
                mode,
                page.outbound_links.len()
            ));
            if !page.title.is_empty() {
                report.push_str(&format!("      Title: {}\n", page.title));
            }
            let excerpt = excerpt(&page.text_content, EXCERPT_CHARS);
            if !excerpt.is_empty() {
                report.push_str(&wrap_text(&excerpt, 80, "      "));
            }
        }
        report.push('\n');
    }

    if !data.errors.is_empty() {
        report.push_str(RULE);
        report.push_str("ERRORS\n");
        report.push_str(RULE);
        report.push('\n');
        for (idx, error) in data.errors.iter().enumerate() {
            report.push_str(&format!("[{}] {}\n", idx + 1, error));
        }
        report.push('\n');
    }

    report.push_str(RULE);
    report.push_str("                             End of Report\n");
    report.push_str(RULE);
    report.push_str("\nGenerated by Trawler\n\n");

    report
}

/// The page results as a JSON array.
pub fn generate_json_report(data: &ReportData) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&data.pages)
}

pub fn generate_markdown_report(data: &ReportData) -> String {
    let mut report = String::new();

    report.push_str("# Trawler Crawl Report\n\n");
    report.push_str(&format!("- **Status:** {}\n", data.status_label()));
    report.push_str(&format!(
        "- **Crawl date:** {}\n",
        data.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("- **Duration:** {:.1} seconds\n", data.duration_seconds));
    report.push_str(&format!("- **Targets:** {}\n", data.format_targets()));
    report.push_str(&format!(
        "- **Pages:** {} ({} dynamic)\n\n",
        data.pages.len(),
        data.dynamic_pages()
    ));

    for (host, pages) in group_by_host(&data.pages) {
        report.push_str(&format!("## {}\n\n", host));
        report.push_str("| Path | Title | Mode | Links |\n");
        report.push_str("|------|-------|------|-------|\n");
        for page in pages {
            report.push_str(&format!(
                "| `{}` | {} | {} | {} |\n",
                extract_url_path(&page.url),
                escape_markdown_cell(&page.title),
                if page.is_dynamic() { "dynamic" } else { "static" },
                page.outbound_links.len()
            ));
        }
        report.push('\n');
    }

    if !data.errors.is_empty() {
        report.push_str("## Errors\n\n");
        for error in &data.errors {
            report.push_str(&format!("- {}\n", error));
        }
        report.push('\n');
    }

    report
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn escape_markdown_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// First `max_chars` characters of whitespace-collapsed text.
fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

pub fn wrap_text(text: &str, width: usize, indent: &str) -> String {
    let mut result = String::new();
    let mut current_line = String::new();
    let limit = width.saturating_sub(indent.len());

    for word in text.split_whitespace() {
        if current_line.len() + word.len() + 1 > limit && !current_line.is_empty() {
            result.push_str(indent);
            result.push_str(&current_line);
            result.push('\n');
            current_line.clear();
        }

        if !current_line.is_empty() {
            current_line.push(' ');
        }
        current_line.push_str(word);
    }

    if !current_line.is_empty() {
        result.push_str(indent);
        result.push_str(&current_line);
        result.push('\n');
    }

    result
}
