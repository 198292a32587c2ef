//! Named pipeline factories a dataset can be initialized with.

use std::collections::BTreeMap;

use harvester_shared::{HarvesterError, Result};

use crate::pipeline_file::PipelineFile;

pub mod openfmri;

/// Template arguments, as recorded in the dataset.
pub type TemplateArgs = BTreeMap<String, String>;

/// A registered crawl template.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    /// Arguments that must be present.
    pub required: &'static [&'static str],
    /// Largefiles expression for datasets created from this template.
    pub default_largefiles: Option<&'static str>,
    build: fn(&TemplateArgs) -> Result<PipelineFile>,
}

/// All built-in templates.
pub const TEMPLATES: &[Template] = &[openfmri::TEMPLATE];

/// Look up a template by name.
pub fn find(name: &str) -> Result<&'static Template> {
    TEMPLATES.iter().find(|t| t.name == name).ok_or_else(|| {
        let known: Vec<&str> = TEMPLATES.iter().map(|t| t.name).collect();
        HarvesterError::config(format!(
            "unknown template {name:?} (available: {})",
            known.join(", ")
        ))
    })
}

impl Template {
    /// Check `args` without building anything.
    pub fn validate(&self, args: &TemplateArgs) -> Result<()> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .copied()
            .filter(|arg| args.get(*arg).is_none_or(|v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(HarvesterError::config(format!(
                "template {} requires: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// The pipeline this template describes for `args`.
    pub fn pipeline(&self, args: &TemplateArgs) -> Result<PipelineFile> {
        self.validate(args)?;
        (self.build)(args)
    }
}
