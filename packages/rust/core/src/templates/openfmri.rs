//! OpenfMRI dataset pages: release archives, the changelog and the license.

use std::collections::BTreeMap;

use serde_json::json;

use harvester_shared::{HarvesterError, Record, Result};

use super::{Template, TemplateArgs};
use crate::pipeline_file::{ElementSpec, NodeSpec, PipelineFile};

/// Where dataset pages live unless `topurl` says otherwise.
pub const DEFAULT_TOPURL: &str = "https://openfmri.org/dataset/";

pub const TEMPLATE: Template = Template {
    name: "openfmri",
    description: "Release archives, changelog and license of an OpenfMRI dataset",
    required: &["dataset"],
    default_largefiles: Some("exclude=*.txt and exclude=README"),
    build,
};

fn build(args: &TemplateArgs) -> Result<PipelineFile> {
    let dataset = args
        .get("dataset")
        .ok_or_else(|| HarvesterError::config("openfmri: missing `dataset`"))?;
    let topurl = args.get("topurl").map_or(DEFAULT_TOPURL, String::as_str);
    Ok(pipeline(dataset, topurl))
}

fn node(spec: NodeSpec) -> ElementSpec {
    ElementSpec::Node(spec)
}

fn assign(field: &str, value: &str, interpolate: bool) -> ElementSpec {
    node(NodeSpec::Assign {
        fields: Record::new().with(field, value),
        overwrite: false,
        interpolate,
    })
}

/// Crawl `<topurl><dataset>/` and annex what it links to.
pub fn pipeline(dataset: &str, topurl: &str) -> PipelineFile {
    let topurl = if topurl.ends_with('/') {
        topurl.to_string()
    } else {
        format!("{topurl}/")
    };
    let archive = format!(
        r".*/{}_R(?P<version>[0-9][0-9.]*)\.tar\.gz$",
        regex::escape(dataset)
    );

    let changelog = vec![
        node(NodeSpec::AHrefMatch {
            pattern: r".*release_history\.txt$".into(),
            min_count: 0,
        }),
        assign("filename", "changelog.txt", false),
        node(NodeSpec::Annex),
    ];
    let releases = vec![
        node(NodeSpec::AHrefMatch {
            pattern: archive,
            min_count: 0,
        }),
        assign("path", "releases/{version}", true),
        node(NodeSpec::Annex),
    ];
    let license_fields: BTreeMap<String, String> = [
        ("url".to_string(), "@href".to_string()),
        ("url_text".to_string(), "text()".to_string()),
    ]
    .into_iter()
    .collect();
    let license = vec![
        node(NodeSpec::CssMatch {
            selector: ".field-name-field-license a".into(),
            fields: license_fields,
            min_count: 0,
        }),
        assign("filename", "license.txt", false),
        node(NodeSpec::Annex),
    ];

    PipelineFile {
        name: Some(format!("openfmri-{dataset}")),
        annex: None,
        pipeline: vec![
            node(NodeSpec::Assign {
                fields: Record::new().with("dataset", json!(dataset)),
                overwrite: false,
                interpolate: false,
            }),
            node(NodeSpec::CrawlUrl {
                url: Some(format!("{topurl}{dataset}/")),
                follow: None,
            }),
            ElementSpec::Branch { branch: changelog },
            ElementSpec::Branch { branch: releases },
            ElementSpec::Branch { branch: license },
            node(NodeSpec::AnnexFinalize),
        ],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use harvester_annex::{AnnexOptions, Annexator, MemoryStore, VersionStore};
    use harvester_crawler::Fetcher;
    use harvester_pipeline::Runner;
    use harvester_shared::FetchConfig;

    use super::*;
    use crate::pipeline_file::BuildEnv;

    const DATASET_PAGE: &str = r#"<html><body>
        <h1>ds666: Sample dataset</h1>
        <a href="release_history.txt">Release History</a>
        <ul>
          <li><a href="ds666_R1.0.0.tar.gz">Release 1.0.0</a></li>
          <li><a href="ds666_R1.0.1.tar.gz">Release 1.0.1</a></li>
          <li><a href="ds667_R1.0.0.tar.gz">Someone else's dataset</a></li>
        </ul>
        <div class="field-name-field-license"><a href="/licenses/pddl">PDDL</a></div>
    </body></html>"#;

    /// A release tarball laid out the way OpenfMRI packs them.
    fn release(version: &str) -> Vec<u8> {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let content = format!("mighty load {version}");
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "ds666/sub-1/anat/sub-1_T1w.dat", content.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    async fn serve(server: &wiremock::MockServer, path: &str, body: &[u8]) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(path))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[test]
    fn pipeline_shape() {
        let file = pipeline("ds000001", "https://openfmri.org/dataset");
        let ElementSpec::Node(NodeSpec::CrawlUrl { url, .. }) = &file.pipeline[1] else {
            panic!("expected crawl_url");
        };
        assert_eq!(url.as_deref(), Some("https://openfmri.org/dataset/ds000001/"));
        let branches = file
            .pipeline
            .iter()
            .filter(|e| matches!(e, ElementSpec::Branch { .. }))
            .count();
        assert_eq!(branches, 3);
        assert_eq!(
            file.pipeline.last(),
            Some(&ElementSpec::Node(NodeSpec::AnnexFinalize))
        );
    }

    #[tokio::test]
    async fn crawls_a_dataset_into_all_branches() {
        let server = wiremock::MockServer::start().await;
        serve(&server, "/ds666/", DATASET_PAGE.as_bytes()).await;
        serve(&server, "/ds666/release_history.txt", b"1.0.1: fixed headers\n").await;
        serve(&server, "/ds666/ds666_R1.0.0.tar.gz", &release("1.0.0")).await;
        serve(&server, "/ds666/ds666_R1.0.1.tar.gz", &release("1.0.1")).await;
        serve(&server, "/licenses/pddl", b"Public Domain Dedication and License\n").await;

        let fetcher = Arc::new(
            Fetcher::new(FetchConfig {
                allow_private_hosts: true,
                ..FetchConfig::default()
            })
            .unwrap(),
        );
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn VersionStore> = store.clone();
        let options = AnnexOptions::default()
            .create(true)
            .largefiles(TEMPLATE.default_largefiles.unwrap());
        let annex = Arc::new(Annexator::with_store(dyn_store, options, Arc::clone(&fetcher)).unwrap());

        let args: TemplateArgs = [
            ("dataset".to_string(), "ds666".to_string()),
            ("topurl".to_string(), format!("{}/", server.uri())),
        ]
        .into_iter()
        .collect();
        let built = TEMPLATE
            .pipeline(&args)
            .unwrap()
            .build(&BuildEnv::new(fetcher).with_annex(Arc::clone(&annex)))
            .unwrap();

        let out = Runner::default().run(&built.pipeline).await.unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].get_str("dataset"), Some("ds666"));

        assert_eq!(
            store.branch_names().unwrap(),
            vec!["git-annex", "incoming", "incoming-processed", "master"]
        );
        let master = store.branch_head("master").unwrap().unwrap();
        assert_eq!(Some(&master), store.branch_head("incoming-processed").unwrap().as_ref());
        assert_ne!(Some(master.clone()), store.branch_head("incoming").unwrap());

        let files: Vec<String> = store.read_tree(&master).unwrap().into_keys().collect();
        assert_eq!(
            files,
            vec![
                ".gitattributes",
                "changelog.txt",
                "license.txt",
                "releases/1.0.0/sub-1/anat/sub-1_T1w.dat",
                "releases/1.0.1/sub-1/anat/sub-1_T1w.dat",
            ]
        );
        assert_eq!(
            annex
                .read_file("master", "releases/1.0.1/sub-1/anat/sub-1_T1w.dat")
                .unwrap()
                .unwrap(),
            b"mighty load 1.0.1"
        );
        // incoming keeps the archives exactly as downloaded
        let incoming = store.branch_head("incoming").unwrap().unwrap();
        let incoming_files: Vec<String> = store.read_tree(&incoming).unwrap().into_keys().collect();
        assert!(incoming_files.contains(&"releases/1.0.1/ds666_R1.0.1.tar.gz".to_string()));
        assert!(!incoming_files.iter().any(|f| f.ends_with("sub-1_T1w.dat")));
        assert_eq!(out.stats.add_annex, 2);
        assert_eq!(out.stats.add_git, 2);
    }
}
