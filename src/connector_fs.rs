//! JSON-lines file connector.
//!
//! Walks a directory tree and reads every matching file as one JSON object
//! per line:
//!
//! ```text
//! {"id": "GSE1", "fields": {"title": "Heart failure in mice", "organism": "NCBITaxon:10090"}}
//! ```
//!
//! Files are parsed on `fetch_workers` blocking tasks; the fetch returns
//! once all of them have finished. Unparseable lines are logged and
//! skipped.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use walkdir::WalkDir;

use concept_index_core::models::{ContentItem, Field, Structure};

use crate::config::ResourceConfig;
use crate::traits::ContentConnector;

#[derive(Debug, Deserialize)]
struct RawItem {
    id: Value,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

pub struct JsonLinesConnector {
    config: ResourceConfig,
    structure: Structure,
    description: String,
}

impl JsonLinesConnector {
    pub fn new(resource_id: &str, config: ResourceConfig) -> Result<Self> {
        let structure = config.structure(resource_id)?;
        let description = format!("JSON lines under {}", config.root.display());
        Ok(Self {
            config,
            structure,
            description,
        })
    }

    /// Matching files under the root, sorted by path.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!(
                "resource '{}': root does not exist: {}",
                self.structure.resource_id,
                root.display()
            );
        }

        let include_set = build_globset(&self.config.include_globs)?;
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&excludes)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ContentConnector for JsonLinesConnector {
    fn resource_id(&self) -> &str {
        &self.structure.resource_id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn connector_type(&self) -> &str {
        "jsonl"
    }

    fn describe_structure(&self) -> &Structure {
        &self.structure
    }

    async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>> {
        let files = self.list_files()?;
        let workers = self.config.fetch_workers.max(1).min(files.len().max(1));

        let mut shards: Vec<Vec<PathBuf>> = vec![Vec::new(); workers];
        for (i, file) in files.into_iter().enumerate() {
            shards[i % workers].push(file);
        }

        let mut tasks = JoinSet::new();
        for shard in shards.into_iter().filter(|s| !s.is_empty()) {
            let structure = self.structure.clone();
            tasks.spawn_blocking(move || -> Result<Vec<ContentItem>> {
                let mut items = Vec::new();
                for path in &shard {
                    items.extend(read_items(path, &structure)?);
                }
                Ok(items)
            });
        }

        let mut items = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            items.extend(joined.context("fetch worker panicked")??);
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(
            resource = %self.structure.resource_id,
            items = items.len(),
            workers,
            "fetched items"
        );
        Ok(items)
    }
}

/// Parse one file. I/O errors fail the fetch; bad lines are skipped.
fn read_items(path: &Path, structure: &Structure) -> Result<Vec<ContentItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut items = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line, structure) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                file = %path.display(),
                line = n + 1,
                error = %e,
                "skipping unparseable item"
            ),
        }
    }
    Ok(items)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse one JSON line. Declared fields come first in structure order;
/// undeclared ones follow so validation can report them.
fn parse_line(line: &str, structure: &Structure) -> Result<ContentItem> {
    let raw: RawItem = serde_json::from_str(line)?;
    let Some(id) = scalar_text(&raw.id) else {
        bail!("item id must be a string or number");
    };

    let mut fields = Vec::with_capacity(raw.fields.len());
    for spec in &structure.fields {
        if let Some(value) = raw.fields.get(&spec.name) {
            if value.is_null() {
                continue;
            }
            let Some(text) = scalar_text(value) else {
                bail!("field '{}' of item '{}' is not text", spec.name, id);
            };
            fields.push(Field {
                name: spec.name.clone(),
                text,
            });
        }
    }
    let mut undeclared: Vec<(&String, &Value)> = raw
        .fields
        .iter()
        .filter(|(name, _)| structure.field(name).is_none())
        .collect();
    undeclared.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in undeclared {
        fields.push(Field {
            name: name.clone(),
            text: scalar_text(value).unwrap_or_default(),
        });
    }

    Ok(ContentItem { id, fields })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldConfig, PolicyKind};
    use std::fs;
    use tempfile::TempDir;

    fn resource(root: &Path, workers: usize) -> ResourceConfig {
        ResourceConfig {
            kind: "jsonl".to_string(),
            root: root.to_path_buf(),
            include_globs: vec!["**/*.jsonl".to_string()],
            exclude_globs: vec!["skip/**".to_string()],
            large: false,
            fetch_workers: workers,
            fields: vec![
                FieldConfig {
                    name: "title".to_string(),
                    weight: 1.0,
                    policy: PolicyKind::Recognize,
                    ontology: None,
                },
                FieldConfig {
                    name: "summary".to_string(),
                    weight: 0.5,
                    policy: PolicyKind::Recognize,
                    ontology: None,
                },
            ],
        }
    }

    fn write_fixture(root: &Path) {
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("skip")).unwrap();
        fs::write(
            root.join("a/one.jsonl"),
            concat!(
                r#"{"id": "B", "fields": {"summary": "lung", "title": "heart"}}"#,
                "\n\n",
                r#"{"id": 7, "fields": {"title": "kidney"}}"#,
                "\n",
                "not json\n",
            ),
        )
        .unwrap();
        fs::write(
            root.join("two.jsonl"),
            r#"{"id": "A", "fields": {"title": "liver", "extra": "x"}}"#,
        )
        .unwrap();
        fs::write(
            root.join("skip/three.jsonl"),
            r#"{"id": "Z", "fields": {"title": "x"}}"#,
        )
        .unwrap();
        fs::write(root.join("notes.txt"), "ignored").unwrap();
    }

    #[tokio::test]
    async fn test_fetch_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        write_fixture(tmp.path());
        let connector = JsonLinesConnector::new("GEO", resource(tmp.path(), 3)).unwrap();

        let items = connector.fetch_new_or_changed_items().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "A", "B"]);

        // Declared fields follow structure order.
        let b = &items[2];
        assert_eq!(b.fields[0].name, "title");
        assert_eq!(b.fields[1].name, "summary");

        // Undeclared fields are kept for validation to reject.
        assert_eq!(items[1].field("extra"), Some("x"));
    }

    #[tokio::test]
    async fn test_single_worker_same_result() {
        let tmp = TempDir::new().unwrap();
        write_fixture(tmp.path());
        let many = JsonLinesConnector::new("GEO", resource(tmp.path(), 8))
            .unwrap()
            .fetch_new_or_changed_items()
            .await
            .unwrap();
        let one = JsonLinesConnector::new("GEO", resource(tmp.path(), 1))
            .unwrap()
            .fetch_new_or_changed_items()
            .await
            .unwrap();
        assert_eq!(many, one);
    }

    #[tokio::test]
    async fn test_missing_root_errors() {
        let tmp = TempDir::new().unwrap();
        let connector =
            JsonLinesConnector::new("GEO", resource(&tmp.path().join("nope"), 2)).unwrap();
        assert!(connector.fetch_new_or_changed_items().await.is_err());
    }

    #[test]
    fn test_parse_line_rejects_nested_values() {
        let structure = resource(Path::new("."), 1).structure("GEO").unwrap();
        assert!(parse_line(r#"{"id": "X", "fields": {"title": {"a": 1}}}"#, &structure).is_err());
        assert!(parse_line(r#"{"id": [1], "fields": {}}"#, &structure).is_err());
        let item = parse_line(r#"{"id": "X", "fields": {"title": null}}"#, &structure).unwrap();
        assert!(item.fields.is_empty());
    }
}
