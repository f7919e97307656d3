//! In-memory [`Store`] implementation for tests and fakes.
//!
//! All tables live in ordinary maps and vectors behind one
//! `std::sync::RwLock`. Sequence numbers come from a single counter shared
//! by direct and expanded annotations, so they never repeat even after
//! rows are deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    AggregatedEntry, Concept, ConceptId, ContentItem, DictionaryVersion, DictionaryVersionId,
    DirectAnnotation, DirectSource, ExpandedAnnotation, Expansion, Mapping, Ontology, OntologyId,
    Relation, Term, TermId, TrackedItem, VirtualOntologyId,
};

use super::{
    ConceptHit, ItemAnnotations, OntologyStats, RemovalReport, Stage, Store, UpsertReport,
    Watermark,
};

struct StoredItem {
    item: ContentItem,
    hash: String,
    processed_version: DictionaryVersionId,
}

struct StoredDirect {
    seq: i64,
    resource: String,
    row: DirectAnnotation,
}

struct StoredExpanded {
    seq: i64,
    resource: String,
    row: ExpandedAnnotation,
}

#[derive(Default)]
struct Tables {
    ontologies: BTreeMap<OntologyId, Ontology>,
    concepts: HashMap<ConceptId, Concept>,
    terms: BTreeMap<TermId, Term>,
    relations: Vec<Relation>,
    mappings: Vec<Mapping>,
    dictionary_versions: Vec<DictionaryVersion>,
    items: BTreeMap<(String, String), StoredItem>,
    direct: Vec<StoredDirect>,
    expanded: Vec<StoredExpanded>,
    aggregates: BTreeMap<(String, String), Vec<AggregatedEntry>>,
    watermarks: HashMap<(String, Stage), Watermark>,
    frequency: HashMap<String, BTreeMap<ConceptId, i64>>,
    resource_ontologies: BTreeMap<(String, OntologyId), DictionaryVersionId>,
    next_seq: i64,
}

impl Tables {
    fn next_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn active_ontologies(&self) -> HashSet<OntologyId> {
        let mut newest: HashMap<VirtualOntologyId, OntologyId> = HashMap::new();
        for o in self.ontologies.values() {
            let slot = newest.entry(o.virtual_id).or_insert(o.id);
            if o.id > *slot {
                *slot = o.id;
            }
        }
        newest.into_values().collect()
    }

    fn has_annotation(&self, resource: &str, item: &str, field: &str, concept: ConceptId) -> bool {
        self.direct.iter().any(|d| {
            d.resource == resource
                && d.row.item_id == item
                && d.row.field == field
                && d.row.concept_id == concept
        }) || self.expanded.iter().any(|e| {
            e.resource == resource
                && e.row.item_id == item
                && e.row.field == field
                && e.row.concept_id == concept
        })
    }

    fn drop_item_rows(&mut self, resource: &str, item_id: &str) {
        self.direct
            .retain(|d| !(d.resource == resource && d.row.item_id == item_id));
        self.expanded
            .retain(|e| !(e.resource == resource && e.row.item_id == item_id));
        self.aggregates
            .remove(&(resource.to_string(), item_id.to_string()));
    }

    fn ontology_of(&self, concept: ConceptId) -> Option<OntologyId> {
        self.concepts.get(&concept).map(|c| c.ontology_id)
    }
}

fn stats_for(stats: &mut BTreeMap<OntologyId, OntologyStats>, o: OntologyId) -> &mut OntologyStats {
    stats.entry(o).or_insert_with(|| OntologyStats {
        ontology_id: o,
        ..Default::default()
    })
}

/// In-memory store for tests and fakes.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_ontologies(&self, ontologies: &[Ontology]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        for o in ontologies {
            let dictionary_version = t
                .ontologies
                .get(&o.id)
                .and_then(|existing| existing.dictionary_version);
            t.ontologies.insert(
                o.id,
                Ontology {
                    dictionary_version,
                    ..o.clone()
                },
            );
        }
        Ok(ontologies.len())
    }

    async fn insert_concepts(&self, concepts: &[Concept]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for c in concepts {
            if !t.concepts.contains_key(&c.id) {
                t.concepts.insert(c.id, c.clone());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn insert_terms(&self, terms: &[Term]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for term in terms {
            if !t.terms.contains_key(&term.id) {
                t.terms.insert(term.id, term.clone());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn insert_relations(&self, relations: &[Relation]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for r in relations {
            let exists = t
                .relations
                .iter()
                .any(|x| x.concept_id == r.concept_id && x.ancestor_id == r.ancestor_id);
            if !exists {
                t.relations.push(*r);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for m in mappings {
            if !t.mappings.contains(m) {
                t.mappings.push(m.clone());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn ontologies(&self) -> Result<Vec<Ontology>> {
        let t = self.tables.read().unwrap();
        Ok(t.ontologies.values().cloned().collect())
    }

    async fn latest_ontology(&self, virtual_id: VirtualOntologyId) -> Result<Option<Ontology>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .ontologies
            .values()
            .filter(|o| o.virtual_id == virtual_id)
            .max_by_key(|o| o.id)
            .cloned())
    }

    async fn concept(&self, id: ConceptId) -> Result<Option<Concept>> {
        let t = self.tables.read().unwrap();
        Ok(t.concepts.get(&id).cloned())
    }

    async fn find_concept(
        &self,
        ontology_id: OntologyId,
        local_id: &str,
    ) -> Result<Option<Concept>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .concepts
            .values()
            .find(|c| c.ontology_id == ontology_id && c.local_id == local_id)
            .cloned())
    }

    async fn terms(&self, ids: &[TermId]) -> Result<Vec<Term>> {
        let t = self.tables.read().unwrap();
        Ok(ids.iter().filter_map(|id| t.terms.get(id).cloned()).collect())
    }

    async fn dictionary_terms(&self, newer_than: Option<DictionaryVersionId>) -> Result<Vec<Term>> {
        let t = self.tables.read().unwrap();
        let active = t.active_ontologies();
        let included: HashSet<OntologyId> = t
            .ontologies
            .values()
            .filter(|o| active.contains(&o.id))
            .filter(|o| match (o.dictionary_version, newer_than) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(d), Some(v)) => d > v,
            })
            .map(|o| o.id)
            .collect();
        Ok(t
            .terms
            .values()
            .filter(|term| {
                t.ontology_of(term.concept_id)
                    .is_some_and(|o| included.contains(&o))
            })
            .cloned()
            .collect())
    }

    async fn ancestors(&self, concept: ConceptId) -> Result<Vec<Relation>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .relations
            .iter()
            .filter(|r| r.concept_id == concept)
            .copied()
            .collect())
    }

    async fn mappings(&self, concept: ConceptId) -> Result<Vec<Mapping>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .mappings
            .iter()
            .filter(|m| m.other_side(concept).is_some())
            .cloned()
            .collect())
    }

    async fn remove_ontology(&self, ontology_id: OntologyId) -> Result<Option<RemovalReport>> {
        let mut t = self.tables.write().unwrap();
        if !t.ontologies.contains_key(&ontology_id) {
            return Ok(None);
        }
        let doomed: HashSet<ConceptId> = t
            .concepts
            .values()
            .filter(|c| c.ontology_id == ontology_id)
            .map(|c| c.id)
            .collect();

        let mut report = RemovalReport {
            ontology_id,
            ..Default::default()
        };
        let mut affected: BTreeSet<(String, String)> = BTreeSet::new();

        let before = t.terms.len();
        t.terms.retain(|_, term| !doomed.contains(&term.concept_id));
        report.terms = before - t.terms.len();

        let before = t.relations.len();
        t.relations
            .retain(|r| !doomed.contains(&r.concept_id) && !doomed.contains(&r.ancestor_id));
        report.relations = before - t.relations.len();

        let before = t.mappings.len();
        t.mappings.retain(|m| {
            !doomed.contains(&m.concept_id) && !doomed.contains(&m.mapped_concept_id)
        });
        report.mappings = before - t.mappings.len();

        let before = t.direct.len();
        t.direct.retain(|d| {
            let keep = !doomed.contains(&d.row.concept_id);
            if !keep {
                affected.insert((d.resource.clone(), d.row.item_id.clone()));
            }
            keep
        });
        report.direct = before - t.direct.len();

        let before = t.expanded.len();
        t.expanded.retain(|e| {
            let keep =
                !doomed.contains(&e.row.concept_id) && !doomed.contains(&e.row.source_concept_id);
            if !keep {
                affected.insert((e.resource.clone(), e.row.item_id.clone()));
            }
            keep
        });
        report.expanded = before - t.expanded.len();

        for entries in t.aggregates.values_mut() {
            let before = entries.len();
            entries.retain(|e| !doomed.contains(&e.concept_id));
            report.aggregated += before - entries.len();
        }
        for counts in t.frequency.values_mut() {
            counts.retain(|concept, _| !doomed.contains(concept));
        }
        t.resource_ontologies.retain(|(_, o), _| *o != ontology_id);

        let before = t.concepts.len();
        t.concepts.retain(|id, _| !doomed.contains(id));
        report.concepts = before - t.concepts.len();
        t.ontologies.remove(&ontology_id);

        report.affected_items = affected.into_iter().collect();
        Ok(Some(report))
    }

    async fn latest_dictionary_version(&self) -> Result<Option<DictionaryVersion>> {
        let t = self.tables.read().unwrap();
        Ok(t.dictionary_versions.last().cloned())
    }

    async fn create_dictionary_version(&self, name: &str) -> Result<DictionaryVersion> {
        let mut t = self.tables.write().unwrap();
        let id = t.dictionary_versions.last().map(|v| v.id).unwrap_or(0) + 1;
        let version = DictionaryVersion {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        t.dictionary_versions.push(version.clone());
        for o in t.ontologies.values_mut() {
            if o.dictionary_version.is_none() {
                o.dictionary_version = Some(id);
            }
        }
        Ok(version)
    }

    async fn upsert_items(&self, resource: &str, items: &[ContentItem]) -> Result<UpsertReport> {
        let mut t = self.tables.write().unwrap();
        let mut report = UpsertReport::default();
        for item in items {
            let key = (resource.to_string(), item.id.clone());
            let hash = item.content_hash();
            match t.items.get(&key).map(|s| s.hash == hash) {
                Some(true) => report.unchanged += 1,
                Some(false) => {
                    t.drop_item_rows(resource, &item.id);
                    t.items.insert(
                        key,
                        StoredItem {
                            item: item.clone(),
                            hash,
                            processed_version: 0,
                        },
                    );
                    report.changed += 1;
                }
                None => {
                    t.items.insert(
                        key,
                        StoredItem {
                            item: item.clone(),
                            hash,
                            processed_version: 0,
                        },
                    );
                    report.inserted += 1;
                }
            }
        }
        Ok(report)
    }

    async fn item_ids(&self, resource: &str) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .items
            .keys()
            .filter(|(r, _)| r == resource)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn items_below_version(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<Vec<TrackedItem>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .items
            .iter()
            .filter(|((r, _), s)| r == resource && s.processed_version < version)
            .map(|(_, s)| TrackedItem {
                item: s.item.clone(),
                processed_version: s.processed_version,
            })
            .collect())
    }

    async fn processed_version(
        &self,
        resource: &str,
        item_id: &str,
    ) -> Result<Option<DictionaryVersionId>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .items
            .get(&(resource.to_string(), item_id.to_string()))
            .map(|s| s.processed_version))
    }

    async fn set_processed_version(
        &self,
        resource: &str,
        item_ids: &[String],
        version: DictionaryVersionId,
    ) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        for id in item_ids {
            if let Some(s) = t.items.get_mut(&(resource.to_string(), id.clone())) {
                s.processed_version = version;
            }
        }
        Ok(())
    }

    async fn insert_direct(&self, resource: &str, rows: &[DirectAnnotation]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for row in rows {
            let existing = t.direct.iter().position(|d| {
                d.resource == resource
                    && d.row.item_id == row.item_id
                    && d.row.field == row.field
                    && d.row.concept_id == row.concept_id
            });
            match existing {
                Some(i) if t.direct[i].row.source.strength() >= row.source.strength() => continue,
                Some(i) => {
                    t.direct.remove(i);
                }
                None => {}
            }
            // A direct row displaces any expanded row for the same concept.
            t.expanded.retain(|e| {
                !(e.resource == resource
                    && e.row.item_id == row.item_id
                    && e.row.field == row.field
                    && e.row.concept_id == row.concept_id)
            });
            let seq = t.next_seq();
            t.direct.push(StoredDirect {
                seq,
                resource: resource.to_string(),
                row: row.clone(),
            });
            n += 1;
        }
        Ok(n)
    }

    async fn direct_since(
        &self,
        resource: &str,
        after: i64,
    ) -> Result<Vec<(i64, DirectAnnotation)>> {
        let t = self.tables.read().unwrap();
        let mut rows: Vec<(i64, DirectAnnotation)> = t
            .direct
            .iter()
            .filter(|d| d.resource == resource && d.seq > after)
            .map(|d| (d.seq, d.row.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows)
    }

    async fn insert_expanded(&self, resource: &str, rows: &[ExpandedAnnotation]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut n = 0;
        for row in rows {
            if t.has_annotation(resource, &row.item_id, &row.field, row.concept_id) {
                continue;
            }
            let seq = t.next_seq();
            t.expanded.push(StoredExpanded {
                seq,
                resource: resource.to_string(),
                row: row.clone(),
            });
            n += 1;
        }
        Ok(n)
    }

    async fn annotation_high_water(&self, resource: &str) -> Result<Watermark> {
        let t = self.tables.read().unwrap();
        Ok(Watermark {
            direct: t
                .direct
                .iter()
                .filter(|d| d.resource == resource)
                .map(|d| d.seq)
                .max()
                .unwrap_or(0),
            expanded: t
                .expanded
                .iter()
                .filter(|e| e.resource == resource)
                .map(|e| e.seq)
                .max()
                .unwrap_or(0),
        })
    }

    async fn items_annotated_since(&self, resource: &str, mark: Watermark) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for d in t.direct.iter() {
            if d.resource == resource && d.seq > mark.direct {
                ids.insert(d.row.item_id.clone());
            }
        }
        for e in t.expanded.iter() {
            if e.resource == resource && e.seq > mark.expanded {
                ids.insert(e.row.item_id.clone());
            }
        }
        Ok(ids.into_iter().collect())
    }

    async fn item_annotations(&self, resource: &str, item_id: &str) -> Result<ItemAnnotations> {
        let t = self.tables.read().unwrap();
        Ok(ItemAnnotations {
            direct: t
                .direct
                .iter()
                .filter(|d| d.resource == resource && d.row.item_id == item_id)
                .map(|d| d.row.clone())
                .collect(),
            expanded: t
                .expanded
                .iter()
                .filter(|e| e.resource == resource && e.row.item_id == item_id)
                .map(|e| e.row.clone())
                .collect(),
        })
    }

    async fn watermark(&self, resource: &str, stage: Stage) -> Result<Watermark> {
        let t = self.tables.read().unwrap();
        Ok(t
            .watermarks
            .get(&(resource.to_string(), stage))
            .copied()
            .unwrap_or_default())
    }

    async fn set_watermark(&self, resource: &str, stage: Stage, mark: Watermark) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.watermarks.insert((resource.to_string(), stage), mark);
        Ok(())
    }

    async fn replace_aggregates(
        &self,
        resource: &str,
        item_id: &str,
        entries: &[AggregatedEntry],
    ) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        let key = (resource.to_string(), item_id.to_string());
        if entries.is_empty() {
            t.aggregates.remove(&key);
        } else {
            t.aggregates.insert(key, entries.to_vec());
        }
        Ok(())
    }

    async fn aggregates(&self, resource: &str, item_id: &str) -> Result<Vec<AggregatedEntry>> {
        let t = self.tables.read().unwrap();
        let mut entries = t
            .aggregates
            .get(&(resource.to_string(), item_id.to_string()))
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| (e.rank.unwrap_or(u32::MAX), e.concept_id));
        Ok(entries)
    }

    async fn aggregated_item_ids(&self, resource: &str) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .aggregates
            .keys()
            .filter(|(r, _)| r == resource)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn clear_aggregates(&self, resource: &str) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut removed = 0;
        t.aggregates.retain(|(r, _), entries| {
            if r == resource {
                removed += entries.len();
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn entries_for_concept(
        &self,
        concept: ConceptId,
        resource: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptHit>> {
        let t = self.tables.read().unwrap();
        let mut hits: Vec<ConceptHit> = t
            .aggregates
            .iter()
            .filter(|((r, _), _)| resource.map_or(true, |want| want == r.as_str()))
            .flat_map(|((r, _), entries)| {
                entries
                    .iter()
                    .filter(|e| e.concept_id == concept)
                    .map(move |e| ConceptHit {
                        resource: r.clone(),
                        entry: e.clone(),
                    })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.entry
                .score
                .partial_cmp(&a.entry.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.resource.cmp(&b.resource))
                .then_with(|| a.entry.item_id.cmp(&b.entry.item_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn recompute_concept_frequency(&self, resource: &str) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut counts: BTreeMap<ConceptId, i64> = BTreeMap::new();
        for ((r, _), entries) in t.aggregates.iter() {
            if r != resource {
                continue;
            }
            for e in entries.iter().filter(|e| e.score > 0.0) {
                *counts.entry(e.concept_id).or_insert(0) += 1;
            }
        }
        let n = counts.len();
        t.frequency.insert(resource.to_string(), counts);
        Ok(n)
    }

    async fn concept_frequency(&self, resource: &str) -> Result<Vec<(ConceptId, i64)>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .frequency
            .get(resource)
            .map(|m| m.iter().map(|(c, n)| (*c, *n)).collect())
            .unwrap_or_default())
    }

    async fn annotation_stats(&self, resource: &str) -> Result<Vec<OntologyStats>> {
        let t = self.tables.read().unwrap();
        let mut stats: BTreeMap<OntologyId, OntologyStats> = BTreeMap::new();
        for d in t.direct.iter().filter(|d| d.resource == resource) {
            if let Some(o) = t.ontology_of(d.row.concept_id) {
                let s = stats_for(&mut stats, o);
                match d.row.source {
                    DirectSource::Matcher { .. } => s.matcher += 1,
                    DirectSource::Reported => s.reported += 1,
                }
            }
        }
        for e in t.expanded.iter().filter(|e| e.resource == resource) {
            if let Some(o) = t.ontology_of(e.row.concept_id) {
                let s = stats_for(&mut stats, o);
                match e.row.expansion {
                    Expansion::Isa { .. } => s.isa += 1,
                    Expansion::Mapping { .. } => s.mapping += 1,
                }
            }
        }
        for ((r, _), entries) in t.aggregates.iter() {
            if r != resource {
                continue;
            }
            for e in entries {
                if let Some(o) = t.ontology_of(e.concept_id) {
                    stats_for(&mut stats, o).aggregated += 1;
                }
            }
        }
        Ok(stats.into_values().collect())
    }

    async fn resources(&self) -> Result<Vec<String>> {
        let t = self.tables.read().unwrap();
        let set: BTreeSet<String> = t.items.keys().map(|(r, _)| r.clone()).collect();
        Ok(set.into_iter().collect())
    }

    async fn record_resource_ontologies(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        let active = t.active_ontologies();
        let included: Vec<OntologyId> = t
            .ontologies
            .values()
            .filter(|o| active.contains(&o.id))
            .filter(|o| o.dictionary_version.is_some_and(|d| d <= version))
            .map(|o| o.id)
            .collect();
        for o in included {
            t.resource_ontologies
                .entry((resource.to_string(), o))
                .or_insert(version);
        }
        Ok(())
    }

    async fn resource_ontologies(
        &self,
        resource: &str,
    ) -> Result<Vec<(OntologyId, DictionaryVersionId)>> {
        let t = self.tables.read().unwrap();
        Ok(t
            .resource_ontologies
            .iter()
            .filter(|((r, _), _)| r == resource)
            .map(|((_, o), v)| (*o, *v))
            .collect())
    }
}
