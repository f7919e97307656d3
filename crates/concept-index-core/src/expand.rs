//! Semantic expansion of direct annotations.
//!
//! Each direct annotation on concept C spawns expanded annotations on the
//! same (item, field):
//!
//! - **is-a closure**: every precomputed ancestor of C, tagged with its level;
//! - **mapping**: every concept mapped to C, in either direction;
//! - **distance**: a declared strategy that never produces rows.
//!
//! Expansion is first-order only (expanded rows are never expanded again)
//! and first-writer-wins: the store suppresses a row whose (item, field,
//! concept) already has a direct or expanded annotation. A per-resource
//! watermark over the direct-annotation sequence makes re-runs pick up
//! only what is new.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{
    ConceptId, DirectAnnotation, ExpandedAnnotation, Expansion, Mapping, Relation, Structure,
};
use crate::store::{Stage, Store};

/// Maximum is-a level an expansion may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IsaDepth {
    /// No bound (`LEVEL_ALL`).
    #[default]
    All,
    Max(u32),
}

impl IsaDepth {
    pub fn allows(&self, level: u32) -> bool {
        match self {
            IsaDepth::All => true,
            IsaDepth::Max(max) => level <= *max,
        }
    }
}

impl From<Option<u32>> for IsaDepth {
    fn from(value: Option<u32>) -> Self {
        value.map_or(IsaDepth::All, IsaDepth::Max)
    }
}

/// Expansion strategies, in the order a pass applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    IsaClosure,
    Mapping,
    /// Kept as a switchable strategy but disabled: it always yields nothing.
    Distance,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::IsaClosure => "isa",
            Strategy::Mapping => "mapping",
            Strategy::Distance => "distance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionOptions {
    pub isa_closure: bool,
    pub mapping: bool,
    pub distance: bool,
    /// Depth bound applied to resources flagged `large`.
    pub max_isa_level_for_large_resources: IsaDepth,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            isa_closure: true,
            mapping: true,
            distance: false,
            max_isa_level_for_large_resources: IsaDepth::All,
        }
    }
}

impl ExpansionOptions {
    pub fn strategies(&self) -> Vec<Strategy> {
        let mut out = Vec::new();
        if self.isa_closure {
            out.push(Strategy::IsaClosure);
        }
        if self.mapping {
            out.push(Strategy::Mapping);
        }
        if self.distance {
            out.push(Strategy::Distance);
        }
        out
    }

    pub fn depth_for(&self, structure: &Structure) -> IsaDepth {
        if structure.large {
            self.max_isa_level_for_large_resources
        } else {
            IsaDepth::All
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpansionReport {
    /// Direct annotations consumed by this pass.
    pub direct_seen: usize,
    pub isa: usize,
    pub mapping: usize,
    pub distance: usize,
    /// Direct annotations whose concept no longer exists.
    pub skipped_missing: usize,
}

impl ExpansionReport {
    pub fn total(&self) -> usize {
        self.isa + self.mapping + self.distance
    }
}

/// Relations and mappings of one concept, `None` once the concept is gone.
type Neighbourhood = Option<(Vec<Relation>, Vec<Mapping>)>;

pub struct Expander<'a> {
    store: &'a dyn Store,
    options: &'a ExpansionOptions,
}

impl<'a> Expander<'a> {
    pub fn new(store: &'a dyn Store, options: &'a ExpansionOptions) -> Self {
        Self { store, options }
    }

    /// Expand the direct annotations added since the last pass.
    pub async fn expand(&self, structure: &Structure) -> Result<ExpansionReport> {
        let resource = structure.resource_id.as_str();

        let mut mark = self.store.watermark(resource, Stage::Expansion).await?;
        let direct = self.store.direct_since(resource, mark.direct).await?;
        let Some(high) = direct.last().map(|(seq, _)| *seq) else {
            debug!(resource, "no new direct annotations to expand");
            return Ok(ExpansionReport::default());
        };
        let rows: Vec<DirectAnnotation> = direct.into_iter().map(|(_, row)| row).collect();
        let report = self.expand_rows(structure, &rows).await?;

        mark.direct = high;
        self.store
            .set_watermark(resource, Stage::Expansion, mark)
            .await?;

        info!(
            resource,
            direct = report.direct_seen,
            isa = report.isa,
            mapping = report.mapping,
            skipped = report.skipped_missing,
            "expansion finished"
        );
        Ok(report)
    }

    /// Re-expand every direct annotation of the given items, leaving the
    /// watermark alone. Rows already present are kept, so this only fills
    /// in what is missing, e.g. after the rows of a retired ontology were
    /// dropped.
    pub async fn expand_items(
        &self,
        structure: &Structure,
        item_ids: &[String],
    ) -> Result<ExpansionReport> {
        let resource = structure.resource_id.as_str();
        let mut direct = Vec::new();
        for item_id in item_ids {
            direct.extend(self.store.item_annotations(resource, item_id).await?.direct);
        }
        if direct.is_empty() {
            return Ok(ExpansionReport::default());
        }
        let report = self.expand_rows(structure, &direct).await?;
        debug!(
            resource,
            items = item_ids.len(),
            written = report.total(),
            "items re-expanded"
        );
        Ok(report)
    }

    async fn expand_rows(
        &self,
        structure: &Structure,
        direct: &[DirectAnnotation],
    ) -> Result<ExpansionReport> {
        let resource = structure.resource_id.as_str();
        let mut report = ExpansionReport {
            direct_seen: direct.len(),
            ..Default::default()
        };

        let mut neighbourhoods: HashMap<ConceptId, Neighbourhood> = HashMap::new();
        let mut live: Vec<&DirectAnnotation> = Vec::with_capacity(direct.len());
        for row in direct {
            if !neighbourhoods.contains_key(&row.concept_id) {
                let n = self.neighbourhood(row.concept_id).await?;
                neighbourhoods.insert(row.concept_id, n);
            }
            match neighbourhoods.get(&row.concept_id) {
                Some(Some(_)) => live.push(row),
                _ => {
                    warn!(
                        resource,
                        item = %row.item_id,
                        concept = row.concept_id,
                        "annotated concept no longer exists; skipping expansion"
                    );
                    report.skipped_missing += 1;
                }
            }
        }

        let depth = self.options.depth_for(structure);
        for strategy in self.options.strategies() {
            let rows = match strategy {
                Strategy::IsaClosure => isa_rows(&live, &neighbourhoods, depth),
                Strategy::Mapping => mapping_rows(&live, &neighbourhoods),
                Strategy::Distance => {
                    debug!(resource, "distance expansion is disabled");
                    Vec::new()
                }
            };
            let written = if rows.is_empty() {
                0
            } else {
                self.store.insert_expanded(resource, &rows).await?
            };
            debug!(
                resource,
                strategy = strategy.as_str(),
                candidates = rows.len(),
                written,
                "expansion strategy applied"
            );
            match strategy {
                Strategy::IsaClosure => report.isa = written,
                Strategy::Mapping => report.mapping = written,
                Strategy::Distance => report.distance = written,
            }
        }
        Ok(report)
    }

    async fn neighbourhood(&self, concept: ConceptId) -> Result<Neighbourhood> {
        if self.store.concept(concept).await?.is_none() {
            return Ok(None);
        }
        let mut relations = if self.options.isa_closure {
            self.store.ancestors(concept).await?
        } else {
            Vec::new()
        };
        relations.sort_by_key(|r| (r.level, r.ancestor_id));
        let mut mappings = if self.options.mapping {
            self.store.mappings(concept).await?
        } else {
            Vec::new()
        };
        mappings.sort_by(|a, b| {
            (a.other_side(concept), &a.mapping_type).cmp(&(b.other_side(concept), &b.mapping_type))
        });
        Ok(Some((relations, mappings)))
    }
}

fn isa_rows(
    live: &[&DirectAnnotation],
    neighbourhoods: &HashMap<ConceptId, Neighbourhood>,
    depth: IsaDepth,
) -> Vec<ExpandedAnnotation> {
    let mut rows = Vec::new();
    for d in live {
        let Some(Some((relations, _))) = neighbourhoods.get(&d.concept_id) else {
            continue;
        };
        for r in relations.iter().filter(|r| depth.allows(r.level)) {
            if r.ancestor_id == d.concept_id {
                continue;
            }
            rows.push(ExpandedAnnotation {
                item_id: d.item_id.clone(),
                field: d.field.clone(),
                concept_id: r.ancestor_id,
                expansion: Expansion::Isa { level: r.level },
                source_concept_id: d.concept_id,
            });
        }
    }
    rows
}

fn mapping_rows(
    live: &[&DirectAnnotation],
    neighbourhoods: &HashMap<ConceptId, Neighbourhood>,
) -> Vec<ExpandedAnnotation> {
    let mut rows = Vec::new();
    for d in live {
        let Some(Some((_, mappings))) = neighbourhoods.get(&d.concept_id) else {
            continue;
        };
        for m in mappings {
            let Some(other) = m.other_side(d.concept_id) else {
                continue;
            };
            if other == d.concept_id {
                continue;
            }
            rows.push(ExpandedAnnotation {
                item_id: d.item_id.clone(),
                field: d.field.clone(),
                concept_id: other,
                expansion: Expansion::Mapping {
                    mapping_type: m.mapping_type.clone(),
                },
                source_concept_id: d.concept_id,
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Concept, ContentItem, DirectSource, FieldPolicy, FieldSpec, Ontology};
    use crate::store::memory::InMemoryStore;

    fn structure(large: bool) -> Structure {
        Structure {
            resource_id: "R".into(),
            fields: vec![
                FieldSpec {
                    name: "title".into(),
                    weight: 1.0,
                    policy: FieldPolicy::Recognize,
                },
                FieldSpec {
                    name: "abstract".into(),
                    weight: 0.5,
                    policy: FieldPolicy::Recognize,
                },
            ],
            large,
        }
    }

    fn direct(item: &str, field: &str, concept: ConceptId) -> DirectAnnotation {
        DirectAnnotation {
            item_id: item.into(),
            field: field.into(),
            concept_id: concept,
            source: DirectSource::Matcher {
                term_id: concept,
                preferred: true,
            },
            dictionary_version: 1,
        }
    }

    /// Chain 1 → 2 → 3 → ... → 8 with precomputed levels, plus mapping 1 ↔ 50
    /// into a second ontology.
    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert_ontologies(&[
                Ontology {
                    id: 1,
                    virtual_id: 10,
                    name: "A".into(),
                    version: "1".into(),
                    dictionary_version: None,
                },
                Ontology {
                    id: 2,
                    virtual_id: 20,
                    name: "B".into(),
                    version: "1".into(),
                    dictionary_version: None,
                },
            ])
            .await
            .unwrap();
        let mut concepts: Vec<Concept> = (1..=8)
            .map(|id| Concept {
                id,
                ontology_id: 1,
                local_id: format!("A:{}", id),
            })
            .collect();
        concepts.push(Concept {
            id: 50,
            ontology_id: 2,
            local_id: "B:50".into(),
        });
        store.insert_concepts(&concepts).await.unwrap();
        let relations: Vec<Relation> = (2..=8)
            .map(|a| Relation {
                concept_id: 1,
                ancestor_id: a,
                level: (a - 1) as u32,
            })
            .collect();
        store.insert_relations(&relations).await.unwrap();
        store
            .insert_mappings(&[Mapping {
                concept_id: 50,
                mapped_concept_id: 1,
                mapping_type: "lexical".into(),
            }])
            .await
            .unwrap();
        store
            .upsert_items("R", &[ContentItem::new("E1").with_field("title", "x")])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_isa_and_symmetric_mapping() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions::default();
        let report = Expander::new(&store, &opts).expand(&structure(false)).await.unwrap();
        assert_eq!(report.isa, 7);
        assert_eq!(report.mapping, 1);

        let ann = store.item_annotations("R", "E1").await.unwrap();
        let mapped = ann.expanded.iter().find(|e| e.concept_id == 50).unwrap();
        assert_eq!(
            mapped.expansion,
            Expansion::Mapping {
                mapping_type: "lexical".into()
            }
        );
        assert_eq!(mapped.source_concept_id, 1);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions::default();
        let expander = Expander::new(&store, &opts);
        let first = expander.expand(&structure(false)).await.unwrap();
        let second = expander.expand(&structure(false)).await.unwrap();
        assert!(first.total() > 0);
        assert_eq!(second, ExpansionReport::default());
        assert_eq!(
            store.item_annotations("R", "E1").await.unwrap().expanded.len(),
            first.total()
        );
    }

    #[tokio::test]
    async fn test_direct_suppresses_expansion() {
        let store = seeded().await;
        store
            .insert_direct("R", &[direct("E1", "title", 3), direct("E1", "title", 1)])
            .await
            .unwrap();
        let opts = ExpansionOptions::default();
        Expander::new(&store, &opts).expand(&structure(false)).await.unwrap();

        let ann = store.item_annotations("R", "E1").await.unwrap();
        assert!(!ann
            .expanded
            .iter()
            .any(|e| e.field == "title" && e.concept_id == 3));
    }

    #[tokio::test]
    async fn test_later_direct_row_displaces_expanded_one() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions::default();
        let expander = Expander::new(&store, &opts);
        expander.expand(&structure(false)).await.unwrap();

        // A later pass matches the ancestor itself.
        store.insert_direct("R", &[direct("E1", "title", 3)]).await.unwrap();
        let second = expander.expand(&structure(false)).await.unwrap();
        assert_eq!(second.direct_seen, 1);
        assert_eq!(second.total(), 0);

        let ann = store.item_annotations("R", "E1").await.unwrap();
        assert!(ann.direct.iter().any(|d| d.concept_id == 3));
        assert!(!ann
            .expanded
            .iter()
            .any(|e| e.field == "title" && e.concept_id == 3));
        // Ancestors 2 and 4..=8 plus the mapping to 50.
        assert_eq!(ann.expanded.len(), 7);
    }

    #[tokio::test]
    async fn test_expand_items_fills_in_missing_rows_only() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions::default();
        let expander = Expander::new(&store, &opts);
        let first = expander.expand(&structure(false)).await.unwrap();

        let again = expander
            .expand_items(&structure(false), &["E1".to_string()])
            .await
            .unwrap();
        assert_eq!(again.direct_seen, 1);
        assert_eq!(again.total(), 0);
        assert_eq!(
            store.item_annotations("R", "E1").await.unwrap().expanded.len(),
            first.total()
        );
        let mark = store.watermark("R", Stage::Expansion).await.unwrap();
        assert!(mark.direct > 0);
    }

    #[tokio::test]
    async fn test_depth_bound_for_large_resources() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions {
            max_isa_level_for_large_resources: IsaDepth::Max(5),
            mapping: false,
            ..Default::default()
        };
        let report = Expander::new(&store, &opts).expand(&structure(true)).await.unwrap();
        assert_eq!(report.isa, 5);
        let ann = store.item_annotations("R", "E1").await.unwrap();
        assert!(ann.expanded.iter().all(|e| match e.expansion {
            Expansion::Isa { level } => level <= 5,
            _ => false,
        }));
    }

    #[tokio::test]
    async fn test_depth_bound_ignored_for_small_resources() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions {
            max_isa_level_for_large_resources: IsaDepth::Max(2),
            ..Default::default()
        };
        let report = Expander::new(&store, &opts).expand(&structure(false)).await.unwrap();
        assert_eq!(report.isa, 7);
    }

    #[tokio::test]
    async fn test_distance_is_a_no_op() {
        let store = seeded().await;
        store.insert_direct("R", &[direct("E1", "title", 1)]).await.unwrap();
        let opts = ExpansionOptions {
            isa_closure: false,
            mapping: false,
            distance: true,
            ..Default::default()
        };
        let report = Expander::new(&store, &opts).expand(&structure(false)).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(report.direct_seen, 1);
    }

    #[tokio::test]
    async fn test_missing_concept_skipped() {
        let store = seeded().await;
        store
            .insert_direct("R", &[direct("E1", "title", 999), direct("E1", "abstract", 1)])
            .await
            .unwrap();
        let opts = ExpansionOptions::default();
        let report = Expander::new(&store, &opts).expand(&structure(false)).await.unwrap();
        assert_eq!(report.skipped_missing, 1);
        assert_eq!(report.isa, 7);
    }

    #[test]
    fn test_isa_depth_from_option() {
        assert_eq!(IsaDepth::from(None), IsaDepth::All);
        assert!(IsaDepth::from(Some(3)).allows(3));
        assert!(!IsaDepth::from(Some(3)).allows(4));
    }
}
