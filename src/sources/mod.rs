// src/sources/mod.rs
pub mod rss;

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::warn;

use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::record::SourceKind;
use crate::worker::Fetcher;

pub use rss::RssFetcher;

/// Max chars kept for any normalized text field.
pub const MAX_TEXT_CHARS: usize = 1500;

/// Normalize feed text: decode entities, strip tags, ASCII quotes,
/// collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// Rough language tag: `zh-CN` when CJK ideographs exceed 30% of chars,
/// `zh` when any are present, `en` otherwise, `unknown` for empty text.
pub fn detect_language(text: &str) -> &'static str {
    let total = text.chars().count();
    if total == 0 {
        return "unknown";
    }
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    if cjk * 10 > total * 3 {
        "zh-CN"
    } else if cjk > 0 {
        "zh"
    } else {
        "en"
    }
}

/// Build the shipped fetcher for a configured source. `Ok(None)` means no
/// fetcher ships for that source; the caller leaves it unscheduled.
pub fn build_fetcher(cfg: &SourceConfig, clock: Arc<dyn Clock>) -> Result<Option<Arc<dyn Fetcher>>> {
    match cfg.kind()? {
        SourceKind::Rss => {
            if cfg.feeds.is_empty() {
                warn!(source = %cfg.name, "rss source has no feeds configured");
            }
            Ok(Some(Arc::new(RssFetcher::http(cfg.feeds.clone(), clock)?)))
        }
        _ => Ok(None),
    }
}
