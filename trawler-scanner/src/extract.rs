//! Static extraction of title, text and links from an HTML document.

use crate::policy::{UrlPolicy, normalize_url};
use crate::result::{PageResult, RenderMode};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;

const SKIPPED_TEXT_CONTAINERS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Parses server-delivered HTML into a [`PageResult`].
pub fn parse_static(url: &str, html: &str, policy: &UrlPolicy) -> PageResult {
    let document = Html::parse_document(html);

    let mut result = PageResult::new(url.to_string());
    result.title = extract_title(&document);
    result.text_content = extract_text(&document);
    result.outbound_links = extract_links(&document, url, policy);
    result.render_mode = RenderMode::Static;

    debug!(
        "Parsed {} - title: {:?}, text length: {}, links: {}",
        url,
        result.title,
        result.text_content.len(),
        result.outbound_links.len()
    );

    result
}

/// Text of the first `<title>` element, trimmed; empty if there is none.
pub fn extract_title(document: &Html) -> String {
    let selector = Selector::parse("title").unwrap();
    document
        .select(&selector)
        .next()
        .map(|title| title.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Visible text of the body with markup stripped and whitespace collapsed.
pub fn extract_text(document: &Html) -> String {
    let body_selector = Selector::parse("body").unwrap();
    let root = document
        .select(&body_selector)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut words: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ElementRef::wrap(ancestor)
                .map(|element| SKIPPED_TEXT_CONTAINERS.contains(&element.value().name()))
                .unwrap_or(false)
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

/// Every `href` value in document order, normalized against `base_url`,
/// with rejects dropped and duplicates removed.
pub fn extract_links(document: &Html, base_url: &str, policy: &UrlPolicy) -> Vec<String> {
    let selector = Selector::parse("[href]").unwrap();
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href")
            && let Some(normalized) = normalize_url(base_url, href, policy)
            && seen.insert(normalized.clone())
        {
            links.push(normalized);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CrawlPolicy;

    fn same_host() -> UrlPolicy {
        CrawlPolicy::default().compile().unwrap()
    }

    #[test]
    fn test_title_trimmed() {
        let html = "<html><head><title>\n  Hello World  </title></head><body></body></html>";
        let result = parse_static("http://a.com/", html, &same_host());
        assert_eq!(result.title, "Hello World");
    }

    #[test]
    fn test_missing_title_is_empty() {
        let result = parse_static("http://a.com/", "<p>no head</p>", &same_host());
        assert_eq!(result.title, "");
    }

    #[test]
    fn test_text_strips_tags_and_scripts() {
        let html = r#"<html><body>
            <h1>Heading</h1>
            <p>Some <b>bold</b> text.</p>
            <script>var hidden = "nope";</script>
            <style>body { color: red; }</style>
        </body></html>"#;
        let result = parse_static("http://a.com/", html, &same_host());
        assert_eq!(result.text_content, "Heading Some bold text.");
    }

    #[test]
    fn test_links_deduplicated_in_order() {
        let html = r#"<body>
            <a href="/b">B</a>
            <a href="/a">A</a>
            <a href="/b#again">B again</a>
            <link rel="stylesheet" href="/style.css">
            <a href="http://other.com/x">external</a>
            <a href="mailto:x@a.com">mail</a>
        </body>"#;
        let result = parse_static("http://a.com/index.html", html, &same_host());
        assert_eq!(
            result.outbound_links,
            vec![
                "http://a.com/b".to_string(),
                "http://a.com/a".to_string(),
                "http://a.com/style.css".to_string(),
            ]
        );
    }

    #[test]
    fn test_result_is_static() {
        let result = parse_static("http://a.com/", "<html></html>", &same_host());
        assert_eq!(result.render_mode, RenderMode::Static);
        assert_eq!(result.url, "http://a.com/");
    }
}
