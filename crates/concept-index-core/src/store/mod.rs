//! Storage abstraction for Concept Index.
//!
//! The [`Store`] trait defines every storage operation needed by the
//! pipeline stages, so each stage takes an explicit `&dyn Store` instead of
//! reaching for shared tables. Backends: [`memory::InMemoryStore`] here,
//! and the SQLite store in the application crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    AggregatedEntry, Concept, ConceptId, ContentItem, DictionaryVersion, DictionaryVersionId,
    DirectAnnotation, ExpandedAnnotation, Mapping, Ontology, OntologyId, Relation, Term, TermId,
    TrackedItem, VirtualOntologyId,
};

/// Pipeline stages that keep a progress watermark per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Expansion,
    Aggregation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Expansion => "expansion",
            Stage::Aggregation => "aggregation",
        }
    }
}

/// Highest annotation sequence numbers a stage has consumed.
///
/// Direct and expanded annotations are numbered by insertion order; a
/// stage only looks at rows above its watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    pub direct: i64,
    pub expanded: i64,
}

/// Result of upserting a fetch of items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// All annotation rows of one item.
#[derive(Debug, Clone, Default)]
pub struct ItemAnnotations {
    pub direct: Vec<DirectAnnotation>,
    pub expanded: Vec<ExpandedAnnotation>,
}

/// What retiring an ontology version deleted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemovalReport {
    pub ontology_id: OntologyId,
    pub concepts: usize,
    pub terms: usize,
    pub relations: usize,
    pub mappings: usize,
    pub direct: usize,
    pub expanded: usize,
    pub aggregated: usize,
    /// `(resource, item_id)` pairs that lost at least one annotation row.
    pub affected_items: Vec<(String, String)>,
}

/// Annotation counts of one resource against one ontology version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OntologyStats {
    pub ontology_id: OntologyId,
    pub matcher: i64,
    pub reported: i64,
    pub isa: i64,
    pub mapping: i64,
    pub aggregated: i64,
}

/// An index entry returned by a concept lookup.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptHit {
    pub resource: String,
    pub entry: AggregatedEntry,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Ontology population | `insert_ontologies`, `insert_concepts`, `insert_terms`, `insert_relations`, `insert_mappings` |
/// | Ontology reads | `ontologies`, `latest_ontology`, `concept`, `find_concept`, `terms`, `dictionary_terms`, `ancestors`, `mappings` |
/// | Retirement | `remove_ontology` |
/// | Dictionary versions | `latest_dictionary_version`, `create_dictionary_version` |
/// | Items | `upsert_items`, `item_ids`, `items_below_version`, `processed_version`, `set_processed_version` |
/// | Annotations | `insert_direct`, `direct_since`, `insert_expanded`, `annotation_high_water`, `items_annotated_since`, `item_annotations` |
/// | Watermarks | `watermark`, `set_watermark` |
/// | Index | `replace_aggregates`, `aggregates`, `aggregated_item_ids`, `clear_aggregates`, `entries_for_concept` |
/// | Derived | `recompute_concept_frequency`, `concept_frequency`, `annotation_stats` |
/// | Tracking | `resources`, `record_resource_ontologies`, `resource_ontologies` |
#[async_trait]
pub trait Store: Send + Sync {
    // ── Ontology population ─────────────────────────────────────────

    /// Insert or replace ontology version rows. `dictionary_version` of an
    /// existing row is preserved.
    async fn insert_ontologies(&self, ontologies: &[Ontology]) -> Result<usize>;

    /// Bulk-append concepts; existing ids are ignored.
    async fn insert_concepts(&self, concepts: &[Concept]) -> Result<usize>;

    /// Bulk-append terms; existing ids are ignored.
    async fn insert_terms(&self, terms: &[Term]) -> Result<usize>;

    /// Bulk-append is-a relations; existing (concept, ancestor) pairs are ignored.
    async fn insert_relations(&self, relations: &[Relation]) -> Result<usize>;

    /// Bulk-append mappings; exact duplicates are ignored.
    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<usize>;

    // ── Ontology reads ──────────────────────────────────────────────

    /// All ontology versions, ascending by id.
    async fn ontologies(&self) -> Result<Vec<Ontology>>;

    /// The active (newest) version of a virtual ontology, if any is loaded.
    async fn latest_ontology(&self, virtual_id: VirtualOntologyId) -> Result<Option<Ontology>>;

    async fn concept(&self, id: ConceptId) -> Result<Option<Concept>>;

    async fn find_concept(&self, ontology_id: OntologyId, local_id: &str)
        -> Result<Option<Concept>>;

    /// Terms with the given ids; unknown ids are silently absent.
    async fn terms(&self, ids: &[TermId]) -> Result<Vec<Term>>;

    /// Terms of active ontology versions, ascending by id.
    ///
    /// With `newer_than = Some(v)`, only terms of ontology versions that
    /// entered a dictionary version greater than `v`.
    async fn dictionary_terms(&self, newer_than: Option<DictionaryVersionId>) -> Result<Vec<Term>>;

    /// Is-a relations from `concept` to its ancestors.
    async fn ancestors(&self, concept: ConceptId) -> Result<Vec<Relation>>;

    /// Mappings where `concept` is on either side.
    async fn mappings(&self, concept: ConceptId) -> Result<Vec<Mapping>>;

    // ── Retirement ──────────────────────────────────────────────────

    /// Retire an ontology version, cascading to every dependent row.
    ///
    /// Returns `None` when the version is not loaded.
    async fn remove_ontology(&self, ontology_id: OntologyId) -> Result<Option<RemovalReport>>;

    // ── Dictionary versions ─────────────────────────────────────────

    async fn latest_dictionary_version(&self) -> Result<Option<DictionaryVersion>>;

    /// Open a new dictionary version and assign it to every ontology
    /// version that has not entered a dictionary yet.
    async fn create_dictionary_version(&self, name: &str) -> Result<DictionaryVersion>;

    // ── Items ───────────────────────────────────────────────────────

    /// Store fetched items. New items start at version 0; items whose
    /// content hash changed are reset to 0 and lose their annotation and
    /// index rows.
    async fn upsert_items(&self, resource: &str, items: &[ContentItem]) -> Result<UpsertReport>;

    /// Distinct item ids stored for a resource.
    async fn item_ids(&self, resource: &str) -> Result<Vec<String>>;

    /// Items whose last-processed version is below `version`, ascending by id.
    async fn items_below_version(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<Vec<TrackedItem>>;

    async fn processed_version(
        &self,
        resource: &str,
        item_id: &str,
    ) -> Result<Option<DictionaryVersionId>>;

    async fn set_processed_version(
        &self,
        resource: &str,
        item_ids: &[String],
        version: DictionaryVersionId,
    ) -> Result<()>;

    // ── Annotations ─────────────────────────────────────────────────

    /// Insert direct annotations keyed by (item, field, concept). An
    /// existing row is replaced only by a strictly stronger source.
    /// Returns the number of rows written.
    async fn insert_direct(&self, resource: &str, rows: &[DirectAnnotation]) -> Result<usize>;

    /// Direct annotations with sequence number above `after`, ascending.
    async fn direct_since(&self, resource: &str, after: i64)
        -> Result<Vec<(i64, DirectAnnotation)>>;

    /// Insert expanded annotations, skipping any (item, field, concept)
    /// that already has a direct or expanded row. Returns rows written.
    async fn insert_expanded(&self, resource: &str, rows: &[ExpandedAnnotation]) -> Result<usize>;

    /// Current highest sequence numbers of direct and expanded rows.
    async fn annotation_high_water(&self, resource: &str) -> Result<Watermark>;

    /// Items with a direct or expanded row above the given watermark.
    async fn items_annotated_since(&self, resource: &str, mark: Watermark) -> Result<Vec<String>>;

    async fn item_annotations(&self, resource: &str, item_id: &str) -> Result<ItemAnnotations>;

    // ── Watermarks ──────────────────────────────────────────────────

    async fn watermark(&self, resource: &str, stage: Stage) -> Result<Watermark>;

    async fn set_watermark(&self, resource: &str, stage: Stage, mark: Watermark) -> Result<()>;

    // ── Index ───────────────────────────────────────────────────────

    /// Replace every index entry of one item.
    async fn replace_aggregates(
        &self,
        resource: &str,
        item_id: &str,
        entries: &[AggregatedEntry],
    ) -> Result<()>;

    /// Index entries of one item, by rank when ranked, else by concept id.
    async fn aggregates(&self, resource: &str, item_id: &str) -> Result<Vec<AggregatedEntry>>;

    async fn aggregated_item_ids(&self, resource: &str) -> Result<Vec<String>>;

    /// Drop every index entry of a resource. Returns rows removed.
    async fn clear_aggregates(&self, resource: &str) -> Result<usize>;

    /// Index entries for a concept, by descending score then item id.
    async fn entries_for_concept(
        &self,
        concept: ConceptId,
        resource: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptHit>>;

    // ── Derived ─────────────────────────────────────────────────────

    /// Recount distinct items with a non-zero entry per concept.
    /// Returns the number of concepts with a count.
    async fn recompute_concept_frequency(&self, resource: &str) -> Result<usize>;

    /// `(concept, item count)` pairs, ascending by concept id.
    async fn concept_frequency(&self, resource: &str) -> Result<Vec<(ConceptId, i64)>>;

    /// Per-ontology annotation and index counts, ascending by ontology id.
    async fn annotation_stats(&self, resource: &str) -> Result<Vec<OntologyStats>>;

    // ── Tracking ────────────────────────────────────────────────────

    /// Resources with stored items, ascending.
    async fn resources(&self) -> Result<Vec<String>>;

    /// Record that the resource has been processed against every active
    /// ontology version included in `version`.
    async fn record_resource_ontologies(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<()>;

    /// `(ontology version, dictionary version)` pairs recorded for a resource.
    async fn resource_ontologies(
        &self,
        resource: &str,
    ) -> Result<Vec<(OntologyId, DictionaryVersionId)>>;
}
