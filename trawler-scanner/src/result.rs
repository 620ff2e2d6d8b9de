use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How the content of a page was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Extracted from the HTML returned by the server
    Static,
    /// Extracted from the DOM after script execution in the render sandbox
    Dynamic,
}

/// Structured crawl output for one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub url: String,
    pub title: String,
    pub text_content: String,
    pub outbound_links: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub fetched_at: DateTime<Utc>,
    pub render_mode: RenderMode,
}

impl PageResult {
    pub fn new(url: String) -> Self {
        Self {
            url,
            title: String::new(),
            text_content: String::new(),
            outbound_links: Vec::new(),
            metadata: Map::new(),
            fetched_at: Utc::now(),
            render_mode: RenderMode::Static,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.render_mode == RenderMode::Dynamic
    }
}
