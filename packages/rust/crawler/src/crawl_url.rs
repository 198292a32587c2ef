//! The URL-crawling source node.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use harvester_pipeline::{Node, NodeOutput, RunContext};
use harvester_shared::{Counter, HarvesterError, Record, Result, fields};

use crate::client::{Fetcher, normalize_url, parse_url};

/// Recursion settings for [`CrawlUrl::follow`].
struct Follow {
    matcher: Arc<dyn Node>,
    max_depth: usize,
}

/// Fetches a URL and emits the document as `response`.
///
/// The URL is either fixed at construction or taken from the incoming
/// record's `url` field.
pub struct CrawlUrl {
    fetcher: Arc<Fetcher>,
    url: Option<String>,
    follow: Option<Follow>,
}

impl CrawlUrl {
    /// Crawl a fixed URL.
    pub fn new(fetcher: Arc<Fetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: Some(url.into()),
            follow: None,
        }
    }

    /// Crawl whatever `url` the incoming record carries.
    pub fn from_record(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            url: None,
            follow: None,
        }
    }

    /// Also fetch the links `matcher` finds on each page, up to `max_depth`
    /// hops away. Every page is fetched at most once.
    pub fn follow(mut self, matcher: Arc<dyn Node>, max_depth: usize) -> Self {
        self.follow = Some(Follow { matcher, max_depth });
        self
    }

    async fn fetch_into(&self, record: &Record, url: &Url, ctx: &RunContext) -> Result<Record> {
        let doc = self.fetcher.fetch_text(url).await?;
        ctx.stats.bump(Counter::Urls);
        Ok(record
            .with(fields::URL, doc.url.as_str())
            .with(fields::RESPONSE, doc.body))
    }

    async fn crawl_recursive(
        &self,
        record: &Record,
        start: Url,
        follow: &Follow,
        ctx: &RunContext,
    ) -> Result<Vec<Record>> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut pages = Vec::new();

        while let Some((url, depth)) = queue.pop_front() {
            if !visited.insert(normalize_url(&url)) {
                continue;
            }

            let page = match self.fetch_into(record, &url, ctx).await {
                Ok(page) => page,
                // the start page must load; broken links further down are skipped
                Err(e) if depth > 0 => {
                    warn!(%url, error = %e, "failed to fetch followed link, skipping");
                    ctx.stats.bump(Counter::Failed);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if depth < follow.max_depth {
                if let NodeOutput::Emit(links) = follow.matcher.call(&page, ctx).await? {
                    for link in links {
                        let Some(raw) = link.get_str(fields::URL) else {
                            continue;
                        };
                        if let Ok(next) = Url::parse(raw) {
                            debug!(%next, depth = depth + 1, "queueing link");
                            queue.push_back((next, depth + 1));
                        }
                    }
                }
            }

            pages.push(page);
        }

        Ok(pages)
    }
}

#[async_trait]
impl Node for CrawlUrl {
    fn name(&self) -> &str {
        "crawl_url"
    }

    async fn call(&self, record: &Record, ctx: &RunContext) -> Result<NodeOutput> {
        let raw = self
            .url
            .as_deref()
            .or_else(|| record.get_str(fields::URL))
            .ok_or_else(|| {
                HarvesterError::validation("crawl_url has no URL and the record has no `url` field")
            })?;
        let url = parse_url(raw)?;
        debug!(%url, "crawling");

        match &self.follow {
            None => Ok(NodeOutput::one(self.fetch_into(record, &url, ctx).await?)),
            Some(follow) => {
                let pages = self.crawl_recursive(record, url, follow, ctx).await?;
                info!(pages = pages.len(), "recursive crawl complete");
                Ok(NodeOutput::Emit(pages))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use harvester_pipeline::{Pipeline, Runner, Sink};
    use harvester_shared::FetchConfig;

    use super::*;
    use crate::matches::AHrefMatch;

    fn fetcher() -> Arc<Fetcher> {
        Arc::new(
            Fetcher::new(FetchConfig {
                allow_private_hosts: true,
                ..FetchConfig::default()
            })
            .unwrap(),
        )
    }

    async fn serve(server: &wiremock::MockServer, path: &str, body: &str) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(path))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn crawls_fixed_url() {
        let server = wiremock::MockServer::start().await;
        serve(&server, "/data-sets", "<html><body>listing</body></html>").await;

        let node = CrawlUrl::new(fetcher(), format!("{}/data-sets", server.uri()));
        let ctx = RunContext::default();
        let out = node.call(&Record::new(), &ctx).await.unwrap();

        let NodeOutput::Emit(records) = out else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert!(records[0].get_str("response").unwrap().contains("listing"));
        assert!(records[0].get_str("url").unwrap().ends_with("/data-sets"));
        assert_eq!(ctx.stats.get(Counter::Urls), 1);
    }

    #[tokio::test]
    async fn crawls_url_from_record_keeping_fields() {
        let server = wiremock::MockServer::start().await;
        serve(&server, "/dataset/ds000001", "<html>ds1</html>").await;

        let node = CrawlUrl::from_record(fetcher());
        let input = Record::new()
            .with("url", format!("{}/dataset/ds000001", server.uri()))
            .with("dataset", "1");
        let out = node.call(&input, &RunContext::default()).await.unwrap();

        let NodeOutput::Emit(records) = out else {
            panic!("expected records");
        };
        assert_eq!(records[0].get_str("dataset"), Some("1"));
        assert_eq!(records[0].get_str("response"), Some("<html>ds1</html>"));
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let node = CrawlUrl::from_record(fetcher());
        let err = node
            .call(&Record::new(), &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvesterError::Validation { .. }));
    }

    #[tokio::test]
    async fn follows_links_up_to_depth_once_each() {
        let server = wiremock::MockServer::start().await;
        serve(
            &server,
            "/",
            r#"<a href="/a">A</a><a href="/b">B</a><a href="/a#again">A again</a>"#,
        )
        .await;
        serve(&server, "/a", r#"<a href="/">home</a><a href="/deep">deep</a>"#).await;
        serve(&server, "/b", "leaf").await;
        serve(&server, "/deep", r#"<a href="/deeper">deeper</a>"#).await;

        let matcher: Arc<dyn Node> = Arc::new(AHrefMatch::new(".*").unwrap());
        let sink = Sink::new("pages");
        let pipeline = Pipeline::builder()
            .node(CrawlUrl::new(fetcher(), format!("{}/", server.uri())).follow(matcher, 2))
            .sink(&sink)
            .build();

        Runner::default().run(&pipeline).await.unwrap();

        let mut paths: Vec<String> = sink
            .project(&["url"])
            .into_iter()
            .filter_map(|v| v[0].as_str().map(|u| Url::parse(u).unwrap().path().to_string()))
            .collect();
        paths.sort();
        // /deeper is three hops away and never fetched
        assert_eq!(paths, vec!["/", "/a", "/b", "/deep"]);
    }
}
