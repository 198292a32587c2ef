//! Declarative pipeline files and the registry turning them into pipelines.
//!
//! ```toml
//! name = "ds000001"
//!
//! [annex]
//! path = "ds000001"
//! create = true
//! largefiles = "exclude=*.txt"
//!
//! [[pipeline]]
//! node = "crawl_url"
//! url = "https://openfmri.org/dataset/ds000001/"
//!
//! [[pipeline]]
//! branch = [
//!   { node = "a_href_match", pattern = '.*release_history\.txt' },
//!   { node = "assign", fields = { filename = "changelog.txt" } },
//!   { node = "annex" },
//! ]
//!
//! [[pipeline]]
//! node = "annex_finalize"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use harvester_annex::{AnnexOptions, Annexator};
use harvester_crawler::{AHrefMatch, CrawlUrl, CssMatch, Extract, Fetcher};
use harvester_pipeline::{
    Assign, FieldMatches, InterruptIf, Node, Pipeline, PipelineBuilder, Range, Sink, UrlFilename,
};
use harvester_shared::{AnnexConfig, HarvesterError, Record, Result};

/// A pipeline file as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Dataset the `annex` nodes write into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annex: Option<AnnexSpec>,

    #[serde(default)]
    pub pipeline: Vec<ElementSpec>,
}

/// `[annex]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnexSpec {
    /// Dataset path, relative to the pipeline file.
    pub path: PathBuf,
    #[serde(default)]
    pub create: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largefiles: Option<String>,
}

/// One entry of a `pipeline` or `branch` list.
///
/// Which of `node`, `branch` and `sink` a table carries decides its kind; a
/// table naming more than one of them is rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ElementSpec {
    Branch { branch: Vec<ElementSpec> },
    Sink { sink: String },
    Node(NodeSpec),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BranchTable {
    branch: Vec<ElementSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SinkTable {
    sink: String,
}

impl<'de> Deserialize<'de> for ElementSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let table = Map::<String, Value>::deserialize(deserializer)?;
        let kinds: Vec<&str> = ["node", "branch", "sink"]
            .into_iter()
            .filter(|key| table.contains_key(*key))
            .collect();
        let value = Value::Object(table);
        let parsed = match kinds.as_slice() {
            ["node"] => NodeSpec::deserialize(value).map(ElementSpec::Node),
            ["branch"] => {
                BranchTable::deserialize(value).map(|t| ElementSpec::Branch { branch: t.branch })
            }
            ["sink"] => SinkTable::deserialize(value).map(|t| ElementSpec::Sink { sink: t.sink }),
            [] => return Err(D::Error::custom("element needs one of `node`, `branch` or `sink`")),
            _ => {
                return Err(D::Error::custom(format!(
                    "element mixes `{}`; use exactly one",
                    kinds.join("` and `")
                )));
            }
        };
        parsed.map_err(D::Error::custom)
    }
}

/// Link-following settings for `crawl_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowSpec {
    /// Regex links must match to be followed.
    pub pattern: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    1
}

/// Node tables, tagged by `node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeSpec {
    CrawlUrl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow: Option<FollowSpec>,
    },
    AHrefMatch {
        pattern: String,
        #[serde(default)]
        min_count: usize,
    },
    CssMatch {
        selector: String,
        /// Field name → `@attr`, `text()` or `html()`.
        #[serde(default)]
        fields: BTreeMap<String, String>,
        #[serde(default)]
        min_count: usize,
    },
    Assign {
        fields: Record,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        interpolate: bool,
    },
    Range {
        #[serde(default)]
        start: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<usize>,
    },
    InterruptIf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Record>,
    },
    FieldMatches {
        field: String,
        pattern: String,
    },
    UrlFilename,
    Annex,
    AnnexFinalize,
}

/// What a pipeline file's nodes are built against.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    pub fetcher: Arc<Fetcher>,
    /// Branch names and default largefiles for datasets opened from `[annex]`.
    pub annex_config: AnnexConfig,
    /// Directory relative `[annex] path`s are resolved against.
    pub base_dir: PathBuf,
    /// Use this dataset instead of opening the one named in `[annex]`.
    pub annex: Option<Arc<Annexator>>,
}

impl BuildEnv {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            annex_config: AnnexConfig::default(),
            base_dir: PathBuf::from("."),
            annex: None,
        }
    }

    pub fn with_annex(mut self, annex: Arc<Annexator>) -> Self {
        self.annex = Some(annex);
        self
    }
}

/// A pipeline ready to run, with the handles needed to inspect its results.
#[derive(Debug)]
pub struct BuiltPipeline {
    pub pipeline: Pipeline,
    /// Named sinks; a name used more than once refers to one sink.
    pub sinks: BTreeMap<String, Arc<Sink>>,
    pub annex: Option<Arc<Annexator>>,
}

impl PipelineFile {
    /// Read and parse a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarvesterError::io(path, e))?;
        Self::parse(&content)
            .map_err(|e| HarvesterError::config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HarvesterError::config(format!("invalid pipeline file: {e}")))
    }

    /// Instantiate every node and assemble the tree.
    #[instrument(skip_all, fields(name = self.name.as_deref().unwrap_or("unnamed")))]
    pub fn build(&self, env: &BuildEnv) -> Result<BuiltPipeline> {
        let annex = match (&env.annex, &self.annex) {
            (Some(annex), _) => Some(Arc::clone(annex)),
            (None, Some(spec)) => Some(Arc::new(open_annex(spec, env)?)),
            (None, None) => None,
        };

        let mut registry = Registry {
            env,
            annex: annex.as_ref(),
            sinks: BTreeMap::new(),
        };
        let mut builder = Pipeline::builder();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        let pipeline = registry.sequence(builder, &self.pipeline)?;
        debug!(tree = %pipeline.describe(), "built pipeline");

        Ok(BuiltPipeline {
            pipeline,
            sinks: registry.sinks,
            annex,
        })
    }
}

fn open_annex(spec: &AnnexSpec, env: &BuildEnv) -> Result<Annexator> {
    let path = if spec.path.is_absolute() {
        spec.path.clone()
    } else {
        env.base_dir.join(&spec.path)
    };
    let mut options = AnnexOptions::new(env.annex_config.clone()).create(spec.create);
    if let Some(expr) = &spec.largefiles {
        options = options.largefiles(expr.clone());
    }
    Annexator::open(&path, options, Arc::clone(&env.fetcher))
}

struct Registry<'a> {
    env: &'a BuildEnv,
    annex: Option<&'a Arc<Annexator>>,
    sinks: BTreeMap<String, Arc<Sink>>,
}

impl Registry<'_> {
    fn sequence(&mut self, mut builder: PipelineBuilder, specs: &[ElementSpec]) -> Result<Pipeline> {
        for spec in specs {
            builder = match spec {
                ElementSpec::Branch { branch } => {
                    let sub = self.sequence(Pipeline::builder(), branch)?;
                    builder.branch(sub)
                }
                ElementSpec::Sink { sink } => {
                    let sink = self
                        .sinks
                        .entry(sink.clone())
                        .or_insert_with(|| Sink::new(sink.clone()));
                    builder.sink(sink)
                }
                ElementSpec::Node(node) => builder.node_arc(self.node(node)?),
            };
        }
        Ok(builder.build())
    }

    fn node(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>> {
        let fetcher = || Arc::clone(&self.env.fetcher);
        let node: Arc<dyn Node> = match spec {
            NodeSpec::CrawlUrl { url, follow } => {
                let crawl = match url {
                    Some(url) => CrawlUrl::new(fetcher(), url.clone()),
                    None => CrawlUrl::from_record(fetcher()),
                };
                match follow {
                    Some(follow) => {
                        let matcher: Arc<dyn Node> = Arc::new(AHrefMatch::new(&follow.pattern)?);
                        Arc::new(crawl.follow(matcher, follow.max_depth))
                    }
                    None => Arc::new(crawl),
                }
            }
            NodeSpec::AHrefMatch { pattern, min_count } => {
                Arc::new(AHrefMatch::new(pattern)?.min_count(*min_count))
            }
            NodeSpec::CssMatch {
                selector,
                fields,
                min_count,
            } => {
                let rules = fields
                    .iter()
                    .map(|(name, rule)| Ok((name.clone(), rule.parse::<Extract>()?)))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(CssMatch::new(selector, rules)?.min_count(*min_count))
            }
            NodeSpec::Assign {
                fields,
                overwrite,
                interpolate,
            } => Arc::new(
                Assign::new(fields.clone())
                    .overwrite(*overwrite)
                    .interpolate(*interpolate),
            ),
            NodeSpec::Range { start, stop } => Arc::new(Range::new(*start, *stop)),
            NodeSpec::InterruptIf { after, fields } => match (after, fields) {
                (Some(n), None) => Arc::new(InterruptIf::after(*n)),
                (None, Some(values)) => Arc::new(InterruptIf::matches(values.clone())),
                _ => {
                    return Err(HarvesterError::config(
                        "interrupt_if needs exactly one of `after` or `fields`",
                    ));
                }
            },
            NodeSpec::FieldMatches { field, pattern } => {
                Arc::new(FieldMatches::new(field.clone(), pattern)?)
            }
            NodeSpec::UrlFilename => Arc::new(UrlFilename),
            NodeSpec::Annex => Arc::clone(self.require_annex("annex")?) as Arc<dyn Node>,
            NodeSpec::AnnexFinalize => Arc::new(self.require_annex("annex_finalize")?.finalize()),
        };
        Ok(node)
    }

    fn require_annex(&self, node: &str) -> Result<&Arc<Annexator>> {
        self.annex.ok_or_else(|| {
            HarvesterError::config(format!(
                "`{node}` node used but the pipeline has no [annex] section"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use harvester_annex::MemoryStore;
    use harvester_shared::FetchConfig;

    use super::*;

    fn env() -> BuildEnv {
        BuildEnv::new(Arc::new(Fetcher::new(FetchConfig::default()).unwrap()))
    }

    const FILE: &str = r#"
name = "links"

[[pipeline]]
node = "crawl_url"
url = "https://openfmri.org/dataset/"

[[pipeline]]
branch = [
  { node = "a_href_match", pattern = '.*/dataset/(?P<dataset>ds\d+)$', min_count = 1 },
  { node = "assign", fields = { kind = "dataset" } },
  { sink = "datasets" },
]

[[pipeline]]
branch = [
  { node = "css_match", selector = "a.license", fields = { url = "@href", url_text = "text()" } },
  { sink = "licenses" },
]

[[pipeline]]
node = "range"
stop = 10

[[pipeline]]
sink = "datasets"
"#;

    #[test]
    fn parses_every_element_kind() {
        let file = PipelineFile::parse(FILE).unwrap();
        assert_eq!(file.name.as_deref(), Some("links"));
        assert_eq!(file.pipeline.len(), 5);
        assert!(matches!(
            &file.pipeline[0],
            ElementSpec::Node(NodeSpec::CrawlUrl { url: Some(_), follow: None })
        ));
        let ElementSpec::Branch { branch } = &file.pipeline[1] else {
            panic!("expected a branch");
        };
        assert!(matches!(
            &branch[0],
            ElementSpec::Node(NodeSpec::AHrefMatch { min_count: 1, .. })
        ));
        assert_eq!(branch[2], ElementSpec::Sink { sink: "datasets".into() });
    }

    #[test]
    fn file_builds_the_same_tree_as_the_builder() {
        let built = PipelineFile::parse(FILE).unwrap().build(&env()).unwrap();

        let datasets = Sink::new("datasets");
        let licenses = Sink::new("licenses");
        let by_hand = Pipeline::builder()
            .node(CrawlUrl::from_record(Arc::new(Fetcher::new(FetchConfig::default()).unwrap())))
            .branch(
                Pipeline::builder()
                    .node(AHrefMatch::new(".*").unwrap())
                    .node(Assign::new(Record::new()))
                    .sink(&datasets)
                    .build(),
            )
            .branch(
                Pipeline::builder()
                    .node(CssMatch::new("a", Vec::<(String, Extract)>::new()).unwrap())
                    .sink(&licenses)
                    .build(),
            )
            .node(Range::first(10))
            .sink(&datasets)
            .build();

        assert_eq!(built.pipeline.describe(), by_hand.describe());
        assert_eq!(built.pipeline.name(), Some("links"));
        // the repeated sink name resolves to one sink
        assert_eq!(built.sinks.len(), 2);
        assert!(built.annex.is_none());
    }

    #[test]
    fn annex_nodes_need_an_annex() {
        let file = PipelineFile::parse(
            r#"
[[pipeline]]
node = "annex"
"#,
        )
        .unwrap();
        let err = file.build(&env()).unwrap_err();
        assert!(err.to_string().contains("[annex]"));

        let store: Arc<dyn harvester_annex::VersionStore> = Arc::new(MemoryStore::new());
        let env = env();
        let annex = Annexator::with_store(
            store,
            AnnexOptions::default().create(true),
            Arc::clone(&env.fetcher),
        )
        .unwrap();
        let built = file.build(&env.with_annex(Arc::new(annex))).unwrap();
        assert_eq!(built.pipeline.describe(), "annex\n");
    }

    #[test]
    fn annex_section_without_create_fails_early() {
        let file = PipelineFile::parse(
            r#"
[annex]
path = "does-not-exist"

[[pipeline]]
node = "annex_finalize"
"#,
        )
        .unwrap();
        let mut env = env();
        env.base_dir = std::env::temp_dir().join(format!("hv-pf-{}", uuid::Uuid::now_v7()));
        let err = file.build(&env).unwrap_err();
        assert!(matches!(err, HarvesterError::Config { .. }));
    }

    #[test]
    fn invalid_node_settings_are_reported() {
        let bad_regex = PipelineFile::parse(
            r#"
[[pipeline]]
node = "field_matches"
field = "url"
pattern = "(unclosed"
"#,
        )
        .unwrap();
        assert!(bad_regex.build(&env()).is_err());

        let bad_interrupt = PipelineFile::parse(
            r#"
[[pipeline]]
node = "interrupt_if"
"#,
        )
        .unwrap();
        assert!(bad_interrupt.build(&env()).is_err());

        let bad_rule = PipelineFile::parse(
            r#"
[[pipeline]]
node = "css_match"
selector = "a"
fields = { url = "//a/@href" }
"#,
        )
        .unwrap();
        assert!(bad_rule.build(&env()).is_err());

        assert!(PipelineFile::parse("[[pipeline]]\nnode = \"teleport\"\n").is_err());
    }

    #[test]
    fn elements_must_name_exactly_one_kind() {
        let mixed = PipelineFile::parse(
            r#"
[[pipeline]]
node = "annex"
sink = "files"
"#,
        )
        .unwrap_err();
        assert!(mixed.to_string().contains("`node` and `sink`"), "{mixed}");

        let stray = PipelineFile::parse(
            r#"
[[pipeline]]
sink = "files"
overwrite = true
"#,
        )
        .unwrap_err();
        assert!(stray.to_string().contains("overwrite"), "{stray}");

        assert!(PipelineFile::parse("[[pipeline]]\nfields = { a = 1 }\n").is_err());
        assert!(PipelineFile::parse("[[pipeline]]\nbranch = [{ sink = \"x\", branch = [] }]\n").is_err());
    }
}
