//! TOML configuration.
//!
//! Everything the `cidx` binary does is driven by one file (default
//! `./config/cidx.toml`). [`load_config`] parses and validates it; any
//! error there is fatal before a pipeline stage runs.
//!
//! ```toml
//! [db]
//! path = "./data/cidx.sqlite"
//!
//! [dictionary]
//! dir = "./data/dictionaries"
//! denylist = ["the", "was"]
//!
//! [matcher]
//! command = "mgrep"
//! args = ["--dictionary", "{dictionary}", "--input", "{input}"]
//!
//! [weights.isa]
//! mode = "exponential"
//! factor = 0.3
//!
//! [resources.GEO]
//! type = "jsonl"
//! root = "./data/geo"
//!
//! [[resources.GEO.fields]]
//! name = "title"
//! weight = 1.0
//! policy = "recognize"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use concept_index_core::expand::{ExpansionOptions, IsaDepth};
use concept_index_core::models::{FieldPolicy, FieldSpec, Structure, VirtualOntologyId};
use concept_index_core::recognize::RecognitionOptions;
use concept_index_core::scoring::Weights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub dictionary: DictionaryConfig,
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DictionaryConfig {
    /// Where dictionary files are published.
    pub dir: PathBuf,
    /// Always match with the full dictionary, never a delta.
    #[serde(default)]
    pub with_complete_dictionary: bool,
    #[serde(default)]
    pub denylist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatcherConfig {
    pub command: String,
    /// Arguments; `{dictionary}` and `{input}` are replaced with file paths.
    #[serde(default = "default_matcher_args")]
    pub args: Vec<String>,
    #[serde(default = "default_matcher_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Scratch directory for batch files; defaults to the dictionary dir.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_matcher_args() -> Vec<String> {
    vec!["{dictionary}".to_string(), "{input}".to_string()]
}
fn default_matcher_timeout() -> u64 {
    600
}
fn default_batch_size() -> usize {
    500
}

impl MatcherConfig {
    pub fn work_dir<'a>(&'a self, dictionary: &'a DictionaryConfig) -> &'a Path {
        self.work_dir.as_deref().unwrap_or(&dictionary.dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub stopwords: Vec<String>,
    #[serde(default = "default_reported_delimiter")]
    pub reported_delimiter: String,
}

fn default_reported_delimiter() -> String {
    ";".to_string()
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            stopwords: Vec::new(),
            reported_delimiter: default_reported_delimiter(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpansionConfig {
    #[serde(default = "default_true")]
    pub isa_closure: bool,
    #[serde(default = "default_true")]
    pub mapping: bool,
    #[serde(default)]
    pub distance: bool,
    /// Absent means no bound.
    #[serde(default)]
    pub max_isa_level_for_large_resources: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            isa_closure: true,
            mapping: true,
            distance: false,
            max_isa_level_for_large_resources: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceConfig {
    /// Connector type; only `jsonl` ships.
    #[serde(rename = "type")]
    pub kind: String,
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub large: bool,
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    pub fields: Vec<FieldConfig>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}
fn default_fetch_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Recognize,
    Reported,
    Skip,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FieldConfig {
    pub name: String,
    pub weight: f64,
    pub policy: PolicyKind,
    /// Virtual ontology id, required for `reported`.
    #[serde(default)]
    pub ontology: Option<VirtualOntologyId>,
}

impl Config {
    pub fn recognition_options(&self) -> RecognitionOptions {
        RecognitionOptions::new(
            self.matcher.batch_size,
            &self.recognition.stopwords,
            &self.recognition.reported_delimiter,
        )
    }

    pub fn expansion_options(&self) -> ExpansionOptions {
        ExpansionOptions {
            isa_closure: self.expansion.isa_closure,
            mapping: self.expansion.mapping,
            distance: self.expansion.distance,
            max_isa_level_for_large_resources: IsaDepth::from(
                self.expansion.max_isa_level_for_large_resources,
            ),
        }
    }

    /// Structures of every configured resource, ascending by id.
    pub fn structures(&self) -> Result<Vec<Structure>> {
        self.resources
            .iter()
            .map(|(id, r)| r.structure(id))
            .collect()
    }
}

impl ResourceConfig {
    pub fn structure(&self, resource_id: &str) -> Result<Structure> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for f in &self.fields {
            let policy = match (f.policy, f.ontology) {
                (PolicyKind::Recognize, _) => FieldPolicy::Recognize,
                (PolicyKind::Skip, _) => FieldPolicy::Skip,
                (PolicyKind::Reported, Some(ontology)) => FieldPolicy::Reported { ontology },
                (PolicyKind::Reported, None) => bail!(
                    "resources.{}.fields '{}': policy 'reported' requires an ontology",
                    resource_id,
                    f.name
                ),
            };
            fields.push(FieldSpec {
                name: f.name.clone(),
                weight: f.weight,
                policy,
            });
        }
        Ok(Structure {
            resource_id: resource_id.to_string(),
            fields,
            large: self.large,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.matcher.command.trim().is_empty() {
        bail!("matcher.command must not be empty");
    }
    if config.matcher.batch_size == 0 {
        bail!("matcher.batch_size must be > 0");
    }
    if config.matcher.timeout_secs == 0 {
        bail!("matcher.timeout_secs must be > 0");
    }
    if config.recognition.reported_delimiter.is_empty() {
        bail!("recognition.reported_delimiter must not be empty");
    }

    if let Err(e) = config.weights.validate() {
        bail!("{}", e);
    }

    for (id, resource) in &config.resources {
        if id.trim().is_empty() || id == "all" {
            bail!("'{}' is not a valid resource id", id);
        }
        match resource.kind.as_str() {
            "jsonl" => {}
            other => bail!(
                "resources.{}: unknown connector type '{}'. Must be jsonl.",
                id,
                other
            ),
        }
        if resource.fetch_workers == 0 {
            bail!("resources.{}.fetch_workers must be > 0", id);
        }
        if resource.fields.is_empty() {
            bail!("resources.{} declares no fields", id);
        }
        let mut seen = std::collections::HashSet::new();
        for f in &resource.fields {
            if !seen.insert(f.name.as_str()) {
                bail!("resources.{}: field '{}' declared twice", id, f.name);
            }
            if !(0.0..=1.0).contains(&f.weight) {
                bail!(
                    "resources.{}.fields '{}': weight must be in [0.0, 1.0]",
                    id,
                    f.name
                );
            }
        }
        resource.structure(id)?;
    }

    Ok(())
}
