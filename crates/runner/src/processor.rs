//! Default processing callback: fetch the feed over HTTP and count its items.
//!
//! Turning items into posts belongs to the CMS; this processor only reports
//! what it saw.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;

use feedsync_core::{FeedProcessor, FeedResource, ProcessOutcome};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches each feed with a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFeedProcessor {
    client: reqwest::Client,
}

impl HttpFeedProcessor {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedProcessor for HttpFeedProcessor {
    async fn process(&self, feed: &FeedResource) -> anyhow::Result<ProcessOutcome> {
        let response = self
            .client
            .get(&feed.url)
            .send()
            .await
            .with_context(|| format!("fetching {}", feed.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{} returned HTTP {}", feed.url, status);
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("reading body of {}", feed.url))?;

        Ok(ProcessOutcome {
            items_processed: count_feed_items(&body),
            posts_created: 0,
        })
    }
}

/// RSS `<item>` plus Atom `<entry>` elements.
pub fn count_feed_items(body: &str) -> u32 {
    let total = count_elements(body, "item") + count_elements(body, "entry");
    u32::try_from(total).unwrap_or(u32::MAX)
}

fn count_elements(body: &str, name: &str) -> usize {
    let open = format!("<{name}");
    body.match_indices(&open)
        .filter(|(at, _)| {
            body[at + open.len()..]
                .chars()
                .next()
                .is_some_and(|c| c == '>' || c == '/' || c.is_ascii_whitespace())
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_rss_items() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>News</title>
  <item><title>One</title></item>
  <item id="2"><title>Two</title></item>
  <item/>
</channel></rss>"#;
        assert_eq!(count_feed_items(rss), 3);
    }

    #[test]
    fn counts_atom_entries() {
        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry><id>a</id></entry>
  <entry
    xml:lang="en"><id>b</id></entry>
</feed>"#;
        assert_eq!(count_feed_items(atom), 2);
    }

    #[test]
    fn ignores_lookalike_elements() {
        let body = "<items><itemCount>4</itemCount><entryPoint/></items>";
        assert_eq!(count_feed_items(body), 0);
        assert_eq!(count_feed_items(""), 0);
    }

    #[test]
    fn client_builds() {
        assert!(HttpFeedProcessor::new().is_ok());
    }
}
