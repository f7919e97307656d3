//! Aggregation of annotations into the ranked index.
//!
//! For each (item, concept) with at least one annotation:
//!
//! ```text
//! score = Σ_f fieldWeight(f) × baseWeight(best annotation on (item, f, concept))
//! ```
//!
//! Per (item, field, concept) exactly one base weight counts: the best
//! direct one if any direct row exists, otherwise the best expanded one.
//! Items are recomputed wholesale, so re-running on unchanged annotations
//! rewrites identical rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::expand::{Expander, ExpansionOptions};
use crate::models::{AggregatedEntry, ConceptId, Structure};
use crate::scoring::Weights;
use crate::store::{ItemAnnotations, RemovalReport, Stage, Store, Watermark};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub items: usize,
    pub entries: usize,
    /// Annotation rows ignored because their field is not declared.
    pub undeclared: usize,
    /// Concepts with a non-zero entry on at least one item.
    pub concepts: usize,
}

/// Score one item's annotations against a structure.
///
/// Returns the entries ordered by concept id (unranked) and the number of
/// annotation rows on undeclared fields.
pub fn score_item(
    structure: &Structure,
    weights: &Weights,
    item_id: &str,
    annotations: &ItemAnnotations,
) -> (Vec<AggregatedEntry>, usize) {
    // (field, concept) -> (best direct, best expanded)
    let mut best: BTreeMap<(&str, ConceptId), (Option<f64>, Option<f64>)> = BTreeMap::new();
    let mut undeclared = 0;

    for d in &annotations.direct {
        if structure.field(&d.field).is_none() {
            undeclared += 1;
            continue;
        }
        let slot = best.entry((d.field.as_str(), d.concept_id)).or_default();
        let w = weights.direct(&d.source);
        slot.0 = Some(slot.0.map_or(w, |cur| cur.max(w)));
    }
    for e in &annotations.expanded {
        if structure.field(&e.field).is_none() {
            undeclared += 1;
            continue;
        }
        let slot = best.entry((e.field.as_str(), e.concept_id)).or_default();
        let w = weights.expanded(&e.expansion);
        slot.1 = Some(slot.1.map_or(w, |cur| cur.max(w)));
    }

    let mut scores: BTreeMap<ConceptId, f64> = BTreeMap::new();
    for ((field, concept), (direct, expanded)) in best {
        let base = direct.or(expanded).unwrap_or(0.0);
        let field_weight = structure.weight(field).unwrap_or(0.0);
        *scores.entry(concept).or_insert(0.0) += field_weight * base;
    }

    let entries = scores
        .into_iter()
        .map(|(concept_id, score)| AggregatedEntry {
            item_id: item_id.to_string(),
            concept_id,
            score,
            rank: None,
        })
        .collect();
    (entries, undeclared)
}

/// Order entries by descending score, ties by ascending concept id, and
/// number them from 0.
pub fn rank_entries(entries: &mut [AggregatedEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.concept_id.cmp(&b.concept_id))
    });
    for (i, e) in entries.iter_mut().enumerate() {
        e.rank = Some(i as u32);
    }
}

pub struct Aggregator<'a> {
    store: &'a dyn Store,
    weights: &'a Weights,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a dyn Store, weights: &'a Weights) -> Self {
        Self { store, weights }
    }

    /// Recompute the items annotated since the last aggregation pass, then
    /// refresh concept frequency.
    pub async fn aggregate(&self, structure: &Structure) -> Result<AggregationReport> {
        let resource = structure.resource_id.as_str();
        let mark = self.store.watermark(resource, Stage::Aggregation).await?;
        let high = self.store.annotation_high_water(resource).await?;
        let dirty = self.store.items_annotated_since(resource, mark).await?;

        let mut report = self.aggregate_items(structure, &dirty).await?;
        self.store
            .set_watermark(resource, Stage::Aggregation, high)
            .await?;
        report.concepts = self.store.recompute_concept_frequency(resource).await?;

        info!(
            resource,
            items = report.items,
            entries = report.entries,
            concepts = report.concepts,
            "aggregation finished"
        );
        Ok(report)
    }

    /// Recompute the given items regardless of the watermark.
    pub async fn aggregate_items(
        &self,
        structure: &Structure,
        item_ids: &[String],
    ) -> Result<AggregationReport> {
        let resource = structure.resource_id.as_str();
        let mut report = AggregationReport::default();
        for item_id in item_ids {
            let annotations = self.store.item_annotations(resource, item_id).await?;
            let (entries, undeclared) = score_item(structure, self.weights, item_id, &annotations);
            if undeclared > 0 {
                warn!(
                    resource,
                    item = %item_id,
                    rows = undeclared,
                    "annotations on undeclared fields ignored"
                );
            }
            self.store
                .replace_aggregates(resource, item_id, &entries)
                .await?;
            report.items += 1;
            report.entries += entries.len();
            report.undeclared += undeclared;
        }
        Ok(report)
    }

    /// Drop the resource's index and rebuild it from every annotation.
    pub async fn reinit(&self, structure: &Structure) -> Result<AggregationReport> {
        let resource = structure.resource_id.as_str();
        let cleared = self.store.clear_aggregates(resource).await?;
        self.store
            .set_watermark(resource, Stage::Aggregation, Watermark::default())
            .await?;
        info!(resource, cleared, "index cleared for re-initialization");
        self.aggregate(structure).await
    }

    /// Rank the entries of every item of a resource. Returns items sorted.
    pub async fn sort(&self, resource: &str) -> Result<usize> {
        let ids = self.store.aggregated_item_ids(resource).await?;
        for item_id in &ids {
            let mut entries = self.store.aggregates(resource, item_id).await?;
            rank_entries(&mut entries);
            self.store
                .replace_aggregates(resource, item_id, &entries)
                .await?;
        }
        debug!(resource, items = ids.len(), "index sorted");
        Ok(ids.len())
    }

    /// Bring the index back in line after an ontology version was retired:
    /// re-expand affected items of configured resources (expansions that
    /// lost to a retired source are written now), re-aggregate and re-rank
    /// them, then refresh concept frequency everywhere.
    pub async fn after_removal(
        &self,
        structures: &[Structure],
        expansion: &ExpansionOptions,
        removal: &RemovalReport,
    ) -> Result<AggregationReport> {
        let by_resource: HashMap<&str, &Structure> = structures
            .iter()
            .map(|s| (s.resource_id.as_str(), s))
            .collect();

        let mut affected: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (resource, item) in &removal.affected_items {
            affected
                .entry(resource.as_str())
                .or_default()
                .push(item.clone());
        }

        let mut total = AggregationReport::default();
        for (resource, items) in &affected {
            let Some(structure) = by_resource.get(resource) else {
                warn!(
                    resource = *resource,
                    items = items.len(),
                    "resource not configured; affected items keep their remaining entries"
                );
                continue;
            };
            Expander::new(self.store, expansion)
                .expand_items(structure, items)
                .await?;
            let report = self.aggregate_items(structure, items).await?;
            for item_id in items {
                let mut entries = self.store.aggregates(resource, item_id).await?;
                rank_entries(&mut entries);
                self.store
                    .replace_aggregates(resource, item_id, &entries)
                    .await?;
            }
            total.items += report.items;
            total.entries += report.entries;
            total.undeclared += report.undeclared;
        }

        let mut resources: BTreeSet<String> = self.store.resources().await?.into_iter().collect();
        resources.extend(affected.keys().map(|r| r.to_string()));
        for resource in &resources {
            total.concepts += self.store.recompute_concept_frequency(resource).await?;
        }
        info!(
            ontology = removal.ontology_id,
            items = total.items,
            "index refreshed after ontology removal"
        );
        Ok(total)
    }
}
