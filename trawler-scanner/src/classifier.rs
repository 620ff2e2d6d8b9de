//! Static vs. dynamic content classification.
//!
//! Decides, per page, whether server HTML is enough or the page has to be
//! rendered in the sandbox. Three tiers: strong markers, a weighted score
//! over weaker signals, and the runtime probe for anything in between.

use crate::analyzer::JsExecutionAnalyzer;
use crate::error::{Result, ScanError};
use crate::extract::parse_static;
use crate::policy::UrlPolicy;
use crate::result::{PageResult, RenderMode};
use crate::sandbox::RenderSandbox;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Score at or above which a page is treated as dynamic without probing.
pub const DYNAMIC_SCORE_THRESHOLD: f64 = 0.6;
/// Score below which a page is treated as static without probing.
pub const STATIC_SCORE_THRESHOLD: f64 = 0.3;

const SCORE_EPSILON: f64 = 1e-9;
const SCRIPT_DENSITY_MIN_TAGS: usize = 10;
const INTERACTIVE_DENSITY_MIN: usize = 20;

const STATIC_GENERATORS: [&str; 9] = [
    "hugo", "jekyll", "hexo", "eleventy", "pelican", "mkdocs", "sphinx", "gitbook", "zola",
];

const FRAMEWORK_BOOTSTRAP_MARKERS: [&str; 12] = [
    "__next_data__",
    "id=\"__next\"",
    "window.__nuxt__",
    "id=\"__nuxt\"",
    "data-reactroot",
    "ng-version=",
    "ng-app",
    "data-v-app",
    "__sveltekit",
    "window.__initial_state__",
    "__apollo_state__",
    "data-server-rendered",
];

const CLIENT_ROUTER_MARKERS: [&str; 5] = [
    "react-router",
    "vue-router",
    "@angular/router",
    "router-outlet",
    "history.pushstate",
];

const REALTIME_API_MARKERS: [&str; 4] = [
    "new websocket(",
    "socket.io",
    "new eventsource(",
    "graphql-ws",
];

static GENERATOR_META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<meta\s[^>]*name\s*=\s*["']?generator[^>]*>"#).unwrap());
static DYNAMIC_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(#!|/(app|dashboard|console|portal|account|search|feed|admin)(/|$|\?))")
        .unwrap()
});
static TEMPLATE_INTERPOLATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*[\w.$]+[^}]*\}\}|\$\{\s*[\w.$]+\s*\}|\[\[\s*[\w.]+\s*\]\]").unwrap());
static DOM_MANIPULATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"document\.createElement\(|\.appendChild\(|\.innerHTML\s*=|\.insertAdjacentHTML\(|\.replaceChildren\(",
    )
    .unwrap()
});
static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\(\s*["'`]|<script[^>]+type\s*=\s*["']module["']"#).unwrap());
static INTERACTIVE_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(button|input|select|textarea)\b|\son(click|change|submit|input)\s*=").unwrap()
});
static LAZY_LOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)loading\s*=\s*["']lazy["']|\sdata-src\s*=|intersectionobserver|lazyload"#).unwrap()
});
static INFINITE_SCROLL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)infinite[-_ ]?scroll|load[-_ ]?more|scrollheight").unwrap()
});
static REALTIME_TRANSPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)wss?://|long[-_]?poll|pusher|signalr|\bsse\b|ably\.realtime"#).unwrap()
});

/// One observable hint about how a page gets its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    StaticSiteGenerator,
    FrameworkBootstrap,
    ClientRouter,
    RealtimeApi,
    DynamicPath,
    TemplateInterpolation,
    ScriptDensity,
    DomManipulation,
    DynamicImport,
    InteractiveDensity,
    LazyLoad,
    InfiniteScroll,
    RealtimeTransport,
}

impl Signal {
    /// Contribution to the weighted score. Strong markers decide on their own
    /// and carry no weight.
    pub fn weight(self) -> f64 {
        match self {
            Signal::DynamicPath
            | Signal::TemplateInterpolation
            | Signal::DynamicImport
            | Signal::RealtimeTransport => 0.3,
            Signal::ScriptDensity
            | Signal::DomManipulation
            | Signal::InteractiveDensity
            | Signal::LazyLoad
            | Signal::InfiniteScroll => 0.2,
            Signal::StaticSiteGenerator
            | Signal::FrameworkBootstrap
            | Signal::ClientRouter
            | Signal::RealtimeApi => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Static,
    Dynamic,
    /// Heuristics could not decide; the runtime probe has the last word.
    Inconclusive,
}

/// Outcome of the heuristic tiers for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub score: f64,
    pub signals: Vec<Signal>,
}

impl Assessment {
    fn decided(verdict: Verdict, signal: Signal) -> Self {
        Self {
            verdict,
            score: 0.0,
            signals: vec![signal],
        }
    }
}

/// Runs the marker and score tiers over `html` fetched from `url`.
pub fn assess(url: &str, html: &str) -> Assessment {
    let lower = html.to_lowercase();

    // Tier 1
    if has_static_generator(html) {
        return Assessment::decided(Verdict::Static, Signal::StaticSiteGenerator);
    }
    if contains_any(&lower, &FRAMEWORK_BOOTSTRAP_MARKERS) {
        return Assessment::decided(Verdict::Dynamic, Signal::FrameworkBootstrap);
    }
    if contains_any(&lower, &CLIENT_ROUTER_MARKERS) {
        return Assessment::decided(Verdict::Dynamic, Signal::ClientRouter);
    }
    if contains_any(&lower, &REALTIME_API_MARKERS) {
        return Assessment::decided(Verdict::Dynamic, Signal::RealtimeApi);
    }

    // Tier 2
    let mut signals = Vec::new();
    if DYNAMIC_PATH.is_match(url) {
        signals.push(Signal::DynamicPath);
    }
    if TEMPLATE_INTERPOLATION.is_match(html) {
        signals.push(Signal::TemplateInterpolation);
    }
    if lower.matches("<script").count() >= SCRIPT_DENSITY_MIN_TAGS {
        signals.push(Signal::ScriptDensity);
    }
    if DOM_MANIPULATION.is_match(html) {
        signals.push(Signal::DomManipulation);
    }
    if DYNAMIC_IMPORT.is_match(html) {
        signals.push(Signal::DynamicImport);
    }
    if INTERACTIVE_ELEMENT.find_iter(html).count() >= INTERACTIVE_DENSITY_MIN {
        signals.push(Signal::InteractiveDensity);
    }
    if LAZY_LOAD.is_match(html) {
        signals.push(Signal::LazyLoad);
    }
    if INFINITE_SCROLL.is_match(html) {
        signals.push(Signal::InfiniteScroll);
    }
    if REALTIME_TRANSPORT.is_match(html) {
        signals.push(Signal::RealtimeTransport);
    }

    let score: f64 = signals.iter().map(|s| s.weight()).sum();
    let verdict = if score + SCORE_EPSILON >= DYNAMIC_SCORE_THRESHOLD {
        Verdict::Dynamic
    } else if score + SCORE_EPSILON < STATIC_SCORE_THRESHOLD {
        Verdict::Static
    } else {
        Verdict::Inconclusive
    };

    debug!(
        "Classified {} - score {:.2}, verdict {:?}, signals {:?}",
        url, score, verdict, signals
    );

    Assessment {
        verdict,
        score,
        signals,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn has_static_generator(html: &str) -> bool {
    GENERATOR_META.find_iter(html).any(|tag| {
        let tag = tag.as_str().to_lowercase();
        STATIC_GENERATORS.iter().any(|generator| tag.contains(generator))
    })
}

/// Classifier with an optional render sandbox for the probe and for
/// dynamic extraction.
pub struct ContentClassifier {
    sandbox: Option<Arc<dyn RenderSandbox>>,
    analyzer: Option<JsExecutionAnalyzer>,
    js_analysis_timeout: Duration,
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentClassifier {
    /// Heuristics only. Inconclusive pages are treated as static.
    pub fn new() -> Self {
        Self {
            sandbox: None,
            analyzer: None,
            js_analysis_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_sandbox(sandbox: Arc<dyn RenderSandbox>) -> Self {
        Self {
            analyzer: Some(JsExecutionAnalyzer::new(sandbox.clone())),
            sandbox: Some(sandbox),
            js_analysis_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_analyzer(mut self, analyzer: JsExecutionAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_js_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.js_analysis_timeout = timeout;
        self
    }

    pub async fn needs_dynamic_crawling(&self, url: &str, html: &str) -> bool {
        self.needs_dynamic_crawling_within(url, html, self.js_analysis_timeout)
            .await
    }

    /// Same as [`Self::needs_dynamic_crawling`] with an explicit probe timeout.
    pub async fn needs_dynamic_crawling_within(
        &self,
        url: &str,
        html: &str,
        js_timeout: Duration,
    ) -> bool {
        let assessment = assess(url, html);
        match assessment.verdict {
            Verdict::Dynamic => true,
            Verdict::Static => false,
            Verdict::Inconclusive => match &self.analyzer {
                Some(analyzer) => {
                    debug!(
                        "Score {:.2} inconclusive for {}, running JavaScript probe",
                        assessment.score, url
                    );
                    analyzer.analyze(url, js_timeout).await.has_dynamic_content
                }
                None => false,
            },
        }
    }

    /// Renders `url` in the sandbox and extracts from the resulting DOM.
    pub async fn parse_dynamic(
        &self,
        url: &str,
        timeout: Duration,
        policy: &UrlPolicy,
    ) -> Result<PageResult> {
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or_else(|| ScanError::RenderError("no render sandbox configured".to_string()))?;

        info!("Rendering {} in sandbox", url);
        let page = sandbox.open(url, timeout).await?;
        let html = page.html().await;
        let title = page.title().await;
        page.close().await;

        let html = html?;
        let title = match title {
            Ok(title) => title.trim().to_string(),
            Err(e) => {
                warn!("Failed to read rendered title for {}: {}", url, e);
                String::new()
            }
        };

        let mut result = parse_static(url, &html, policy);
        if !title.is_empty() {
            result.title = title.clone();
        }
        result.render_mode = RenderMode::Dynamic;
        result
            .metadata
            .insert("dynamic_crawled".to_string(), Value::Bool(true));
        result
            .metadata
            .insert("page_title".to_string(), Value::String(title));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CrawlPolicy;
    use crate::sandbox::mock::ScriptedSandbox;
    use std::collections::HashMap;

    // ============================================================================
    // Heuristic tiers
    // ============================================================================

    #[test]
    fn test_next_bootstrap_is_dynamic() {
        let html = r#"<html><body><div id="__next"></div>
            <script id="__NEXT_DATA__" type="application/json">{}</script></body></html>"#;
        let assessment = assess("http://a.com/", html);
        assert_eq!(assessment.verdict, Verdict::Dynamic);
        assert_eq!(assessment.signals, vec![Signal::FrameworkBootstrap]);
    }

    #[test]
    fn test_realtime_api_is_dynamic() {
        let html = "<script>const ws = new WebSocket('wss://a.com/live');</script>";
        assert_eq!(assess("http://a.com/", html).verdict, Verdict::Dynamic);
    }

    #[test]
    fn test_static_generator_overrides_everything() {
        let html = r#"<html><head>
            <meta name="generator" content="Hugo 0.121.0">
            </head><body>
            <div data-reactroot></div>
            <img loading="lazy" src="a.png">
            <button>Load more</button>
            </body></html>"#;
        let assessment = assess("http://a.com/app/", html);
        assert_eq!(assessment.verdict, Verdict::Static);
        assert_eq!(assessment.signals, vec![Signal::StaticSiteGenerator]);
    }

    #[test]
    fn test_plain_page_is_static() {
        let html = "<html><head><title>About</title></head><body><p>Hello</p></body></html>";
        let assessment = assess("http://a.com/about", html);
        assert_eq!(assessment.verdict, Verdict::Static);
        assert_eq!(assessment.score, 0.0);
    }

    #[test]
    fn test_weak_signals_add_up_to_dynamic() {
        let html = r#"<body>
            <p>Hello {{ user.name }}</p>
            <script>import('./chunk.js');</script>
        </body>"#;
        let assessment = assess("http://a.com/page", html);
        assert!(assessment.signals.contains(&Signal::TemplateInterpolation));
        assert!(assessment.signals.contains(&Signal::DynamicImport));
        assert_eq!(assessment.verdict, Verdict::Dynamic);
    }

    #[test]
    fn test_three_light_signals_reach_dynamic() {
        let html = r#"<body>
            <img loading="lazy" data-src="x.png">
            <div class="infinite-scroll"></div>
            <script>document.createElement('div');</script>
        </body>"#;
        let assessment = assess("http://a.com/page", html);
        assert!((assessment.score - 0.6).abs() < 1e-9);
        assert_eq!(assessment.verdict, Verdict::Dynamic);
    }

    #[test]
    fn test_middle_score_is_inconclusive() {
        let html = r#"<body><img loading="lazy" src="a.png"><div id="list"></div>
            <script>el.innerHTML = rows;</script></body>"#;
        let assessment = assess("http://a.com/page", html);
        assert!((assessment.score - 0.4).abs() < 1e-9);
        assert_eq!(assessment.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn test_dynamic_path_segment() {
        let assessment = assess("http://a.com/dashboard/reports", "<p>x</p>");
        assert_eq!(assessment.signals, vec![Signal::DynamicPath]);
        assert_eq!(assessment.verdict, Verdict::Inconclusive);
    }

    // ============================================================================
    // Probe delegation
    // ============================================================================

    #[tokio::test]
    async fn test_strong_marker_skips_probe() {
        let sandbox = Arc::new(ScriptedSandbox::default());
        let classifier = ContentClassifier::with_sandbox(sandbox.clone());

        let html = r#"<div ng-version="17.0.0"></div>"#;
        assert!(classifier.needs_dynamic_crawling("http://a.com/", html).await);
        assert_eq!(sandbox.opens(), 0);
    }

    #[tokio::test]
    async fn test_static_generator_skips_probe() {
        let sandbox = Arc::new(ScriptedSandbox::default());
        let classifier = ContentClassifier::with_sandbox(sandbox.clone());

        let html = r#"<meta content="Jekyll v4.3.2" name="generator"><script>el.innerHTML = x;</script>"#;
        assert!(!classifier.needs_dynamic_crawling("http://a.com/app/", html).await);
        assert_eq!(sandbox.opens(), 0);
    }

    #[tokio::test]
    async fn test_inconclusive_delegates_to_probe() {
        let sandbox = Arc::new(ScriptedSandbox {
            counters: HashMap::from([("ajax", 2)]),
            ..ScriptedSandbox::default()
        });
        let classifier = ContentClassifier::with_sandbox(sandbox.clone())
            .with_js_analysis_timeout(Duration::from_millis(20));

        let needs = classifier
            .needs_dynamic_crawling("http://a.com/dashboard/", "<p>x</p>")
            .await;
        assert!(needs);
        assert_eq!(sandbox.opens(), 1);
    }

    #[tokio::test]
    async fn test_inconclusive_without_sandbox_is_static() {
        let classifier = ContentClassifier::new();
        assert!(
            !classifier
                .needs_dynamic_crawling("http://a.com/dashboard/", "<p>x</p>")
                .await
        );
    }

    // ============================================================================
    // Dynamic extraction
    // ============================================================================

    #[tokio::test]
    async fn test_parse_dynamic_marks_result() {
        let sandbox = Arc::new(ScriptedSandbox {
            title: "Rendered".to_string(),
            html: r#"<html><head><title>Shell</title></head>
                <body><p>Loaded by script</p><a href="/next"></a></body></html>"#
                .to_string(),
            ..ScriptedSandbox::default()
        });
        let classifier = ContentClassifier::with_sandbox(sandbox);
        let policy = CrawlPolicy::default().compile().unwrap();

        let result = classifier
            .parse_dynamic("http://a.com/", Duration::from_secs(1), &policy)
            .await
            .unwrap();

        assert_eq!(result.render_mode, RenderMode::Dynamic);
        assert_eq!(result.title, "Rendered");
        assert_eq!(result.text_content, "Loaded by script");
        assert_eq!(result.outbound_links, vec!["http://a.com/next".to_string()]);
        assert_eq!(result.metadata.get("dynamic_crawled"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_parse_dynamic_timeout_is_error() {
        let sandbox = Arc::new(ScriptedSandbox {
            unreachable: true,
            ..ScriptedSandbox::default()
        });
        let classifier = ContentClassifier::with_sandbox(sandbox);
        let policy = CrawlPolicy::default().compile().unwrap();

        let result = classifier
            .parse_dynamic("http://a.com/", Duration::from_millis(10), &policy)
            .await;
        assert!(matches!(result, Err(ScanError::RenderTimeout(_))));
    }

    #[tokio::test]
    async fn test_parse_dynamic_without_sandbox() {
        let policy = CrawlPolicy::default().compile().unwrap();
        let result = ContentClassifier::new()
            .parse_dynamic("http://a.com/", Duration::from_millis(10), &policy)
            .await;
        assert!(matches!(result, Err(ScanError::RenderError(_))));
    }
}
