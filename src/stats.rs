//! Index statistics.
//!
//! Provides a quick summary of what's indexed: per resource, how many
//! annotations each ontology version contributed by kind, how many index
//! entries it owns, and the most frequent concepts. Used by `cidx stats`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use concept_index_core::models::{ConceptId, OntologyId};
use concept_index_core::store::{OntologyStats, Store};

/// Stats of one resource.
pub struct ResourceStats {
    pub resource: String,
    pub items: usize,
    pub ontologies: Vec<OntologyStats>,
    /// Most frequent concepts, `(concept, items)`, descending by count.
    pub top_concepts: Vec<(ConceptId, i64)>,
}

const TOP_CONCEPTS: usize = 5;

pub async fn collect(store: &dyn Store) -> Result<Vec<ResourceStats>> {
    let mut out = Vec::new();
    for resource in store.resources().await? {
        let items = store.item_ids(&resource).await?.len();
        let ontologies = store.annotation_stats(&resource).await?;
        let mut top_concepts = store.concept_frequency(&resource).await?;
        top_concepts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_concepts.truncate(TOP_CONCEPTS);
        out.push(ResourceStats {
            resource,
            items,
            ontologies,
            top_concepts,
        });
    }
    Ok(out)
}

/// `cidx stats`.
pub async fn run_stats(store: &dyn Store, db_path: &Path) -> Result<()> {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let names: HashMap<OntologyId, String> = store
        .ontologies()
        .await?
        .into_iter()
        .map(|o| (o.id, format!("{} {}", o.name, o.version)))
        .collect();
    let version = store.latest_dictionary_version().await?;

    println!("Concept Index — Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Ontologies:  {}", names.len());
    match version {
        Some(v) => println!("  Dictionary:  v{} ({})", v.id, v.name),
        None => println!("  Dictionary:  none"),
    }

    for r in collect(store).await? {
        println!();
        println!("  {} ({} items)", r.resource, r.items);
        println!(
            "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "ONTOLOGY", "MATCHER", "REPORTED", "IS-A", "MAPPING", "INDEX"
        );
        println!("  {}", "-".repeat(76));
        for s in &r.ontologies {
            let name = names
                .get(&s.ontology_id)
                .map(|n| format!("{} [{}]", n, s.ontology_id))
                .unwrap_or_else(|| s.ontology_id.to_string());
            println!(
                "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>8}",
                name, s.matcher, s.reported, s.isa, s.mapping, s.aggregated
            );
        }
        if !r.top_concepts.is_empty() {
            let top: Vec<String> = r
                .top_concepts
                .iter()
                .map(|(c, n)| format!("{} ({})", c, n))
                .collect();
            println!("  top concepts: {}", top.join(", "));
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
