//! Display-name extraction from channel page markup.
//!
//! Heuristics run in a fixed order and the first non-empty result wins:
//!
//! 1. `<meta property="og:title" content="...">`
//! 2. `<title>` with the trailing site suffix removed
//! 3. `name` from an `application/ld+json` block

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static OG_TITLE_PROPERTY_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\s+property\s*=\s*"og:title"\s+content\s*=\s*"([^"]*)""#).unwrap()
});
static OG_TITLE_CONTENT_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\s+content\s*=\s*"([^"]*)"\s+property\s*=\s*"og:title""#).unwrap()
});
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<title[^>]*>([^<]+)</title>").unwrap());
static SITE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*-\s*YouTube\s*$").unwrap());
static JSON_LD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]+type\s*=\s*"application/ld\+json"[^>]*>(.*?)</script>"#)
        .unwrap()
});
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(amp|lt|gt|quot|#39|apos);").unwrap());

/// Which heuristic produced a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    OgTitle,
    Title,
    JsonLd,
}

/// Extract a display name from a channel page.
#[must_use]
pub fn extract_display_name(html: &str) -> Option<String> {
    extract_with_source(html).map(|(name, _)| name)
}

/// Like [`extract_display_name`], also reporting which heuristic matched.
#[must_use]
pub fn extract_with_source(html: &str) -> Option<(String, NameSource)> {
    if let Some(name) = og_title(html) {
        return Some((name, NameSource::OgTitle));
    }
    if let Some(name) = page_title(html) {
        return Some((name, NameSource::Title));
    }
    json_ld_name(html).map(|name| (name, NameSource::JsonLd))
}

fn og_title(html: &str) -> Option<String> {
    [&*OG_TITLE_PROPERTY_FIRST, &*OG_TITLE_CONTENT_FIRST]
        .into_iter()
        .filter_map(|re| re.captures(html))
        .find_map(|caps| non_empty(&caps[1]))
}

fn page_title(html: &str) -> Option<String> {
    let caps = TITLE.captures(html)?;
    let stripped = SITE_SUFFIX.replace(&caps[1], "");
    non_empty(&stripped)
}

fn json_ld_name(html: &str) -> Option<String> {
    JSON_LD.captures_iter(html).find_map(|caps| {
        // Malformed blocks are skipped, never surfaced.
        let data: Value = serde_json::from_str(caps[1].trim()).ok()?;
        match data {
            Value::Array(items) => items.iter().find_map(name_field),
            other => name_field(&other),
        }
    })
}

fn name_field(value: &Value) -> Option<String> {
    value.get("name")?.as_str().and_then(non_empty)
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(decode_entities(trimmed))
    }
}

/// Decode the small entity set channel pages use in titles.
///
/// Single pass: `&amp;lt;` becomes `&lt;`, not `<`.
#[must_use]
pub fn decode_entities(raw: &str) -> String {
    ENTITY
        .replace_all(raw, |caps: &Captures<'_>| match &caps[1] {
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            _ => "'",
        })
        .into_owned()
}
