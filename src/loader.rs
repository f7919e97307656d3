//! Ontology bundle loading and retirement.
//!
//! A bundle is a directory of tab-separated files, one row per line:
//!
//! | File | Columns | Required |
//! |------|---------|----------|
//! | `ontologies.tsv` | id, virtual_id, name, version | yes |
//! | `concepts.tsv` | id, ontology_id, local_id | yes |
//! | `terms.tsv` | id, concept_id, text, preferred (0/1) | yes |
//! | `relations.tsv` | concept_id, ancestor_id, level | no |
//! | `mappings.tsv` | concept_id, mapped_concept_id, mapping_type | no |
//!
//! Blank lines and lines starting with `#` are ignored. Any other line that
//! does not parse aborts the load before anything is written.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::info;

use concept_index_core::aggregate::Aggregator;
use concept_index_core::models::{Concept, Mapping, Ontology, OntologyId, Relation, Term};
use concept_index_core::store::Store;

use crate::config::Config;

#[derive(Debug, Default)]
pub struct OntologyBundle {
    pub ontologies: Vec<Ontology>,
    pub concepts: Vec<Concept>,
    pub terms: Vec<Term>,
    pub relations: Vec<Relation>,
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub ontologies: usize,
    pub concepts: usize,
    pub terms: usize,
    pub relations: usize,
    pub mappings: usize,
}

/// Data lines of a TSV file with their 1-based line numbers.
fn rows(content: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let t = line.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .map(|(n, line)| (n + 1, line.trim_end_matches('\r').split('\t').collect()))
}

fn column<T: FromStr>(file: &str, line: usize, cols: &[&str], index: usize, name: &str) -> Result<T> {
    let Some(raw) = cols.get(index) else {
        bail!("{}:{}: missing column '{}'", file, line, name);
    };
    match raw.trim().parse::<T>() {
        Ok(v) => Ok(v),
        Err(_) => bail!("{}:{}: invalid {} '{}'", file, line, name, raw.trim()),
    }
}

fn text_column(file: &str, line: usize, cols: &[&str], index: usize, name: &str) -> Result<String> {
    match cols.get(index).map(|s| s.trim()) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => bail!("{}:{}: missing column '{}'", file, line, name),
    }
}

pub fn parse_ontologies(content: &str) -> Result<Vec<Ontology>> {
    const FILE: &str = "ontologies.tsv";
    rows(content)
        .map(|(n, cols)| -> Result<Ontology> {
            Ok(Ontology {
                id: column(FILE, n, &cols, 0, "id")?,
                virtual_id: column(FILE, n, &cols, 1, "virtual_id")?,
                name: text_column(FILE, n, &cols, 2, "name")?,
                version: text_column(FILE, n, &cols, 3, "version")?,
                dictionary_version: None,
            })
        })
        .collect()
}

pub fn parse_concepts(content: &str) -> Result<Vec<Concept>> {
    const FILE: &str = "concepts.tsv";
    rows(content)
        .map(|(n, cols)| -> Result<Concept> {
            Ok(Concept {
                id: column(FILE, n, &cols, 0, "id")?,
                ontology_id: column(FILE, n, &cols, 1, "ontology_id")?,
                local_id: text_column(FILE, n, &cols, 2, "local_id")?,
            })
        })
        .collect()
}

pub fn parse_terms(content: &str) -> Result<Vec<Term>> {
    const FILE: &str = "terms.tsv";
    rows(content)
        .map(|(n, cols)| -> Result<Term> {
            let preferred: u8 = column(FILE, n, &cols, 3, "preferred")?;
            if preferred > 1 {
                bail!("{}:{}: preferred must be 0 or 1, got {}", FILE, n, preferred);
            }
            Ok(Term {
                id: column(FILE, n, &cols, 0, "id")?,
                concept_id: column(FILE, n, &cols, 1, "concept_id")?,
                // Term text is kept verbatim apart from surrounding blanks.
                text: text_column(FILE, n, &cols, 2, "text")?,
                preferred: preferred == 1,
            })
        })
        .collect()
}

pub fn parse_relations(content: &str) -> Result<Vec<Relation>> {
    const FILE: &str = "relations.tsv";
    rows(content)
        .map(|(n, cols)| -> Result<Relation> {
            let level: u32 = column(FILE, n, &cols, 2, "level")?;
            if level == 0 {
                bail!("{}:{}: level must be at least 1", FILE, n);
            }
            Ok(Relation {
                concept_id: column(FILE, n, &cols, 0, "concept_id")?,
                ancestor_id: column(FILE, n, &cols, 1, "ancestor_id")?,
                level,
            })
        })
        .collect()
}

pub fn parse_mappings(content: &str) -> Result<Vec<Mapping>> {
    const FILE: &str = "mappings.tsv";
    rows(content)
        .map(|(n, cols)| -> Result<Mapping> {
            Ok(Mapping {
                concept_id: column(FILE, n, &cols, 0, "concept_id")?,
                mapped_concept_id: column(FILE, n, &cols, 1, "mapped_concept_id")?,
                mapping_type: text_column(FILE, n, &cols, 2, "mapping_type")?,
            })
        })
        .collect()
}

async fn read_file(dir: &Path, name: &str, required: bool) -> Result<Option<String>> {
    let path = dir.join(name);
    if !required && !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(content))
}

/// Read and parse every file of a bundle directory.
pub async fn read_bundle(dir: &Path) -> Result<OntologyBundle> {
    if !dir.is_dir() {
        bail!("ontology bundle not found: {}", dir.display());
    }
    let mut bundle = OntologyBundle::default();
    if let Some(c) = read_file(dir, "ontologies.tsv", true).await? {
        bundle.ontologies = parse_ontologies(&c)?;
    }
    if let Some(c) = read_file(dir, "concepts.tsv", true).await? {
        bundle.concepts = parse_concepts(&c)?;
    }
    if let Some(c) = read_file(dir, "terms.tsv", true).await? {
        bundle.terms = parse_terms(&c)?;
    }
    if let Some(c) = read_file(dir, "relations.tsv", false).await? {
        bundle.relations = parse_relations(&c)?;
    }
    if let Some(c) = read_file(dir, "mappings.tsv", false).await? {
        bundle.mappings = parse_mappings(&c)?;
    }
    Ok(bundle)
}

/// Write a parsed bundle into the store.
pub async fn load_bundle(store: &dyn Store, bundle: &OntologyBundle) -> Result<LoadReport> {
    Ok(LoadReport {
        ontologies: store.insert_ontologies(&bundle.ontologies).await?,
        concepts: store.insert_concepts(&bundle.concepts).await?,
        terms: store.insert_terms(&bundle.terms).await?,
        relations: store.insert_relations(&bundle.relations).await?,
        mappings: store.insert_mappings(&bundle.mappings).await?,
    })
}

/// `cidx ontology load <dir>`.
pub async fn run_load(store: &dyn Store, dir: &Path) -> Result<()> {
    let bundle = read_bundle(dir).await?;
    let report = load_bundle(store, &bundle).await?;
    info!(
        dir = %dir.display(),
        ontologies = report.ontologies,
        concepts = report.concepts,
        terms = report.terms,
        "loaded ontology bundle"
    );

    println!("ontology load {}", dir.display());
    println!("  ontologies: {}", report.ontologies);
    println!("  concepts: {}", report.concepts);
    println!("  terms: {}", report.terms);
    println!("  relations: {}", report.relations);
    println!("  mappings: {}", report.mappings);
    println!("ok");
    Ok(())
}

/// `cidx ontology remove <id>`.
pub async fn run_remove(config: &Config, store: &dyn Store, ontology_id: OntologyId) -> Result<()> {
    let Some(removal) = store.remove_ontology(ontology_id).await? else {
        bail!("ontology version {} is not loaded", ontology_id);
    };
    let structures = config.structures()?;
    let refreshed = Aggregator::new(store, &config.weights)
        .after_removal(&structures, &config.expansion_options(), &removal)
        .await?;

    println!("ontology remove {}", ontology_id);
    println!("  concepts: {}", removal.concepts);
    println!("  terms: {}", removal.terms);
    println!("  relations: {}", removal.relations);
    println!("  mappings: {}", removal.mappings);
    println!("  direct annotations: {}", removal.direct);
    println!("  expanded annotations: {}", removal.expanded);
    println!("  index entries: {}", removal.aggregated);
    println!("  items re-aggregated: {}", refreshed.items);
    println!("ok");
    Ok(())
}

/// `cidx ontology list`.
pub async fn run_list(store: &dyn Store) -> Result<()> {
    let ontologies = store.ontologies().await?;
    let mut newest: HashMap<i64, OntologyId> = HashMap::new();
    for o in &ontologies {
        let e = newest.entry(o.virtual_id).or_insert(o.id);
        *e = (*e).max(o.id);
    }

    println!(
        "{:<8} {:<8} {:<24} {:<12} {:<8} DICTIONARY",
        "ID", "VIRTUAL", "NAME", "VERSION", "ACTIVE"
    );
    for o in &ontologies {
        let active = newest.get(&o.virtual_id) == Some(&o.id);
        let dict = o
            .dictionary_version
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "pending".to_string());
        println!(
            "{:<8} {:<8} {:<24} {:<12} {:<8} {}",
            o.id,
            o.virtual_id,
            o.name,
            o.version,
            if active { "yes" } else { "no" },
            dict
        );
    }
    Ok(())
}
