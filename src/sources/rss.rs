// src/sources/rss.rs
//! RSS 2.0 fetcher. One configured feed costs one quota unit; the budget
//! bounds how many feeds are polled per invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use super::{detect_language, normalize_text};
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::record::{Payload, Record, Scalar, SourceKind};
use crate::worker::{FetchBudget, FetchOutcome, Fetcher};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPTS: usize = 2;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const USER_AGENT: &str = concat!("feed-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(default)]
    category: Vec<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

/// Parse one feed body into records stamped `fetched_at`.
pub fn parse_feed(xml: &str, feed: &FeedConfig, fetched_at: DateTime<Utc>) -> Result<Vec<Record>> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&xml_clean).with_context(|| format!("parsing rss xml for {}", feed.name))?;

    let publisher = feed
        .name
        .split_once(" - ")
        .map_or(feed.name.as_str(), |(p, _)| p)
        .to_string();
    let category = feed
        .category
        .clone()
        .unwrap_or_else(|| "uncategorized".to_string());
    let crawl_ts = fetched_at.timestamp();

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let title = normalize_text(it.title.as_deref().unwrap_or_default());
        let summary = normalize_text(it.description.as_deref().unwrap_or_default());
        let url = it.link.unwrap_or_default().trim().to_string();
        let published = it
            .pub_date
            .as_deref()
            .and_then(parse_rfc2822_to_unix)
            .unwrap_or(crawl_ts);
        let text = if summary.is_empty() {
            title.clone()
        } else {
            format!("{title}\n\n{summary}")
        };
        let author = it
            .author
            .map(|a| normalize_text(&a))
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| publisher.clone());

        let mut p = Payload::new();
        p.insert("language".into(), Scalar::from(detect_language(&format!("{title}{summary}"))));
        p.insert("word_count".into(), Scalar::from(text.split_whitespace().count() as i64));
        p.insert("title".into(), Scalar::from(title));
        p.insert("summary".into(), Scalar::from(summary));
        p.insert("url".into(), Scalar::from(url));
        p.insert("published".into(), Scalar::from(published));
        p.insert("timestamp".into(), Scalar::from(published));
        p.insert("crawl_timestamp".into(), Scalar::from(crawl_ts));
        p.insert("source".into(), Scalar::from(SourceKind::Rss.as_str()));
        p.insert("feed_source".into(), Scalar::from(feed.name.as_str()));
        p.insert("feed_url".into(), Scalar::from(feed.url.as_str()));
        p.insert("feed_category".into(), Scalar::from(category.as_str()));
        p.insert("publisher".into(), Scalar::from(publisher.as_str()));
        p.insert("author".into(), Scalar::from(author));
        if let Some(c) = it.category.into_iter().next() {
            p.insert("category".into(), Scalar::from(normalize_text(&c)));
        }
        p.insert("text".into(), Scalar::from(text));

        out.push(Record::at(SourceKind::Rss, fetched_at, p));
    }

    histogram!("ingest_parse_ms", "source" => SourceKind::Rss.as_str())
        .record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(out)
}

enum Mode {
    Http(reqwest::Client),
    /// Bodies keyed by feed URL; a missing URL behaves like an HTTP error.
    Fixtures(HashMap<String, String>),
}

pub struct RssFetcher {
    feeds: Vec<FeedConfig>,
    mode: Mode,
    clock: Arc<dyn Clock>,
}

impl RssFetcher {
    pub fn http(feeds: Vec<FeedConfig>, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("building rss http client")?;
        Ok(Self {
            feeds,
            mode: Mode::Http(client),
            clock,
        })
    }

    pub fn from_fixtures(
        feeds: Vec<FeedConfig>,
        bodies: HashMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feeds,
            mode: Mode::Fixtures(bodies),
            clock,
        }
    }

    async fn body(&self, feed: &FeedConfig) -> Result<String> {
        match &self.mode {
            Mode::Fixtures(bodies) => bodies
                .get(&feed.url)
                .cloned()
                .ok_or_else(|| anyhow!("no fixture for {}", feed.url)),
            Mode::Http(client) => {
                let mut last_err = None;
                for attempt in 1..=ATTEMPTS {
                    match get_text(client, &feed.url).await {
                        Ok(body) => return Ok(body),
                        Err(e) => {
                            debug!(feed = %feed.name, attempt, error = ?e, "rss request failed");
                            last_err = Some(e);
                            if attempt < ATTEMPTS {
                                tokio::time::sleep(RETRY_DELAY).await;
                            }
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| anyhow!("rss request failed")))
            }
        }
    }
}

async fn get_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    resp.text().await.context("reading rss body")
}

#[async_trait]
impl Fetcher for RssFetcher {
    fn source(&self) -> SourceKind {
        SourceKind::Rss
    }

    async fn fetch(&self, budget: FetchBudget) -> FetchOutcome {
        let allowed = budget.clamp(self.feeds.len() as u64) as usize;
        if allowed < self.feeds.len() {
            debug!(allowed, configured = self.feeds.len(), "rss budget limits feeds this run");
        }

        let mut records = Vec::new();
        let mut units = 0u64;
        let mut failures: Vec<String> = Vec::new();

        for feed in self.feeds.iter().take(allowed) {
            units += 1;
            let parsed = match self.body(feed).await {
                Ok(body) => parse_feed(&body, feed, self.clock.now()),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(mut v) => {
                    debug!(feed = %feed.name, items = v.len(), "rss feed parsed");
                    records.append(&mut v);
                }
                Err(e) => {
                    warn!(feed = %feed.name, error = ?e, "rss feed failed");
                    counter!("ingest_provider_errors_total", "source" => SourceKind::Rss.as_str())
                        .increment(1);
                    failures.push(format!("{}: {e:#}", feed.name));
                }
            }
        }

        if failures.is_empty() {
            FetchOutcome::ok(records, units)
        } else {
            let err = anyhow!(
                "{} of {} feeds failed; {}",
                failures.len(),
                units,
                failures.join("; ")
            );
            if records.is_empty() {
                FetchOutcome::failed(err, units)
            } else {
                FetchOutcome::partial(records, units, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2822_parses_to_unix() {
        assert_eq!(
            parse_rfc2822_to_unix("Tue, 10 Jun 2025 14:00:00 +0000"),
            Some(1_749_564_000)
        );
        assert_eq!(parse_rfc2822_to_unix("yesterday"), None);
    }

    #[test]
    fn publisher_is_prefix_before_dash() {
        let feed = FeedConfig {
            name: "Reuters - Markets".into(),
            url: "https://r.test/rss".into(),
            category: None,
        };
        let xml = r#"<rss><channel><item><title>A</title><link>https://r.test/a</link></item></channel></rss>"#;
        let recs = parse_feed(xml, &feed, Utc::now()).unwrap();
        assert_eq!(recs[0].payload["publisher"], Scalar::from("Reuters"));
        assert_eq!(recs[0].payload["author"], Scalar::from("Reuters"));
        assert_eq!(recs[0].payload["feed_category"], Scalar::from("uncategorized"));
    }

    #[test]
    fn empty_channel_yields_nothing() {
        let feed = FeedConfig {
            name: "Empty".into(),
            url: "u".into(),
            category: None,
        };
        let recs = parse_feed("<rss><channel><title>x</title></channel></rss>", &feed, Utc::now()).unwrap();
        assert!(recs.is_empty());
    }
}
