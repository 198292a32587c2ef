//! Extraction nodes matching links and elements inside a fetched document.
//!
//! Both matchers read the document from the record's `response` field and
//! emit one record per match. The emitted record keeps the input's fields,
//! adds the extracted ones, and replaces `response` with the matched
//! element's HTML so matchers can be chained to search within a match.

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use harvester_pipeline::{Node, NodeOutput, RunContext};
use harvester_shared::{HarvesterError, Record, Result, fields};

use crate::client::resolve_href;

/// The document body and its URL, or an error naming the matcher.
fn document<'r>(record: &'r Record, matcher: &str) -> Result<(&'r str, Option<Url>)> {
    let body = record.get_str(fields::RESPONSE).ok_or_else(|| {
        HarvesterError::validation(format!(
            "{matcher}: record has no `response`; place a crawl_url node upstream"
        ))
    })?;
    let base = record.get_str(fields::URL).and_then(|u| Url::parse(u).ok());
    Ok((body, base))
}

fn check_min_count(matcher: &str, found: usize, min_count: usize) -> Result<()> {
    if found < min_count {
        return Err(HarvesterError::parse(format!(
            "{matcher}: expected at least {min_count} matches, found {found}"
        )));
    }
    Ok(())
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

// ---------------------------------------------------------------------------
// AHrefMatch
// ---------------------------------------------------------------------------

/// Emits a record for every `<a href>` whose absolute URL matches a regex.
///
/// Named capture groups become record fields, e.g.
/// `.*/dataset/(?P<dataset_dir>ds0*(?P<dataset>[1-9][0-9]*))$`.
pub struct AHrefMatch {
    pattern: Regex,
    min_count: usize,
}

impl AHrefMatch {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| HarvesterError::parse(format!("invalid href pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern,
            min_count: 0,
        })
    }

    /// Fail when fewer than `n` links match.
    pub fn min_count(mut self, n: usize) -> Self {
        self.min_count = n;
        self
    }

    fn extract(&self, record: &Record) -> Result<Vec<Record>> {
        let (body, base) = document(record, "a_href_match")?;
        let doc = Html::parse_document(body);
        let anchors = Selector::parse("a[href]")
            .map_err(|e| HarvesterError::parse(format!("anchor selector: {e:?}")))?;

        let mut out = Vec::new();
        for el in doc.select(&anchors) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_href(base.as_ref(), href) else {
                continue;
            };
            let Some(caps) = self.pattern.captures(url.as_str()) else {
                continue;
            };

            let mut matched = record
                .with(fields::URL, url.as_str())
                .with(fields::URL_HREF, href)
                .with(fields::URL_TEXT, element_text(&el))
                .with(fields::RESPONSE, el.html());
            for name in self.pattern.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    matched.insert(name, m.as_str());
                }
            }
            out.push(matched);
        }

        check_min_count("a_href_match", out.len(), self.min_count)?;
        debug!(pattern = %self.pattern, matches = out.len(), "matched links");
        Ok(out)
    }
}

#[async_trait]
impl Node for AHrefMatch {
    fn name(&self) -> &str {
        "a_href_match"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        Ok(NodeOutput::Emit(self.extract(record)?))
    }
}

// ---------------------------------------------------------------------------
// CssMatch
// ---------------------------------------------------------------------------

/// How a field value is pulled out of a matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// `@name`: an attribute value.
    Attr(String),
    /// `text()`: the trimmed text content.
    Text,
    /// `html()`: the element's outer HTML.
    Html,
}

impl std::str::FromStr for Extract {
    type Err = HarvesterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "text()" => Ok(Self::Text),
            "html()" | "." => Ok(Self::Html),
            attr if attr.starts_with('@') && attr.len() > 1 => Ok(Self::Attr(attr[1..].to_string())),
            other => Err(HarvesterError::parse(format!(
                "unsupported extraction rule {other:?} (expected @attr, text() or html())"
            ))),
        }
    }
}

/// Emits a record per element matched by a CSS selector, with fields
/// extracted according to a field → [`Extract`] mapping.
///
/// A field named `url` is resolved against the document URL.
pub struct CssMatch {
    selector: String,
    fields: Vec<(String, Extract)>,
    min_count: usize,
}

impl CssMatch {
    pub fn new<I, K>(selector: &str, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Extract)>,
        K: Into<String>,
    {
        // parsed again per document; this only validates early
        Selector::parse(selector)
            .map_err(|e| HarvesterError::parse(format!("invalid selector {selector:?}: {e:?}")))?;
        Ok(Self {
            selector: selector.to_string(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            min_count: 0,
        })
    }

    /// Fail when fewer than `n` elements match.
    pub fn min_count(mut self, n: usize) -> Self {
        self.min_count = n;
        self
    }

    fn extract(&self, record: &Record) -> Result<Vec<Record>> {
        let (body, base) = document(record, "css_match")?;
        let doc = Html::parse_document(body);
        let selector = Selector::parse(&self.selector)
            .map_err(|e| HarvesterError::parse(format!("invalid selector: {e:?}")))?;

        let mut out = Vec::new();
        for el in doc.select(&selector) {
            let mut matched = record.with(fields::RESPONSE, el.html());
            for (field, rule) in &self.fields {
                let value = match rule {
                    Extract::Attr(name) => el.value().attr(name).map(str::to_string),
                    Extract::Text => Some(element_text(&el)),
                    Extract::Html => Some(el.html()),
                };
                let Some(mut value) = value else {
                    continue;
                };
                if field == fields::URL {
                    if let Some(resolved) = resolve_href(base.as_ref(), &value) {
                        value = resolved.to_string();
                    }
                }
                matched.insert(field.as_str(), value);
            }
            out.push(matched);
        }

        check_min_count("css_match", out.len(), self.min_count)?;
        debug!(selector = %self.selector, matches = out.len(), "matched elements");
        Ok(out)
    }
}

#[async_trait]
impl Node for CssMatch {
    fn name(&self) -> &str {
        "css_match"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        Ok(NodeOutput::Emit(self.extract(record)?))
    }
}
