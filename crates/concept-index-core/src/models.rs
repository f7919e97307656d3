//! Core data models used throughout Concept Index.
//!
//! Ontology-side types ([`Ontology`], [`Concept`], [`Term`], [`Relation`],
//! [`Mapping`]) are append-mostly and loaded from upstream files. The
//! resource side ([`ContentItem`], [`Structure`]) comes from connectors.
//! Annotation types are produced by the pipeline stages.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StructureError;

pub type ConceptId = i64;
pub type TermId = i64;
/// Identifier of one ontology *version*.
pub type OntologyId = i64;
/// Stable identifier grouping all versions of an ontology.
pub type VirtualOntologyId = i64;
pub type DictionaryVersionId = i64;

/// One version of an ontology.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ontology {
    pub id: OntologyId,
    pub virtual_id: VirtualOntologyId,
    pub name: String,
    pub version: String,
    /// Dictionary version this ontology first entered, `None` until the
    /// next dictionary is opened.
    pub dictionary_version: Option<DictionaryVersionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Concept {
    pub id: ConceptId,
    pub ontology_id: OntologyId,
    /// Concept identifier local to its ontology (e.g. `GO:0008150`).
    pub local_id: String,
}

/// A lexical string denoting one concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Term {
    pub id: TermId,
    pub concept_id: ConceptId,
    pub text: String,
    /// `true` for the concept's preferred name, `false` for a synonym.
    pub preferred: bool,
}

/// Precomputed is-a edge from a concept to one of its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub concept_id: ConceptId,
    pub ancestor_id: ConceptId,
    /// Shortest is-a distance, 1 for a direct parent.
    pub level: u32,
}

/// Association between two concepts, possibly across ontologies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub concept_id: ConceptId,
    pub mapped_concept_id: ConceptId,
    pub mapping_type: String,
}

impl Mapping {
    /// The concept on the other side of this mapping from `concept`, if
    /// `concept` participates in it. Mappings are read in both directions.
    pub fn other_side(&self, concept: ConceptId) -> Option<ConceptId> {
        if self.concept_id == concept {
            Some(self.mapped_concept_id)
        } else if self.mapped_concept_id == concept {
            Some(self.concept_id)
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub text: String,
}

/// An external record produced by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub fields: Vec<Field>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            text: text.into(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.text.as_str())
    }

    /// SHA-256 over the id and every field, used to detect changed items.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        for field in &self.fields {
            hasher.update([0u8]);
            hasher.update(field.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(field.text.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// How the text of a field turns into direct annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldPolicy {
    /// Run through the matcher.
    Recognize,
    /// Already carries delimiter-separated local concept ids from the
    /// given (virtual) ontology.
    Reported { ontology: VirtualOntologyId },
    /// Not annotated.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    /// Relevance weight in `[0, 1]`.
    pub weight: f64,
    pub policy: FieldPolicy,
}

/// Ordered field layout of a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Structure {
    pub resource_id: String,
    pub fields: Vec<FieldSpec>,
    /// Large resources get a bounded is-a expansion depth.
    pub large: bool,
}

impl Structure {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn weight(&self, name: &str) -> Option<f64> {
        self.field(name).map(|f| f.weight)
    }

    /// Check an item against this structure.
    pub fn validate(&self, item: &ContentItem) -> Result<(), StructureError> {
        if item.id.trim().is_empty() {
            return Err(StructureError::EmptyId);
        }
        if item.id.contains(['\t', '\n', '\r']) {
            return Err(StructureError::InvalidId(item.id.clone()));
        }
        let mut seen = HashSet::new();
        for field in &item.fields {
            if self.field(&field.name).is_none() {
                return Err(StructureError::UndeclaredField {
                    resource: self.resource_id.clone(),
                    item: item.id.clone(),
                    field: field.name.clone(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(StructureError::DuplicateField {
                    item: item.id.clone(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Processing state of an item within one recognition run.
///
/// An item leaves the run advanced to the dictionary version only from
/// `ReportedMerged`; any other final state keeps its previous marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Queued,
    Matched,
    ReportedMerged,
}

/// A content item together with its last-processed dictionary version
/// (0 when never processed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedItem {
    pub item: ContentItem,
    pub processed_version: DictionaryVersionId,
}

// ═══════════════════════════════════════════════════════════════════════
// Annotations
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirectSource {
    Matcher { term_id: TermId, preferred: bool },
    Reported,
}

impl DirectSource {
    /// Ordering used when two recognitions land on the same
    /// (item, field, concept): the stronger one is kept.
    pub fn strength(&self) -> u8 {
        match self {
            DirectSource::Matcher {
                preferred: false, ..
            } => 1,
            DirectSource::Matcher { preferred: true, .. } | DirectSource::Reported => 2,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DirectSource::Matcher { .. } => "matcher",
            DirectSource::Reported => "reported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectAnnotation {
    pub item_id: String,
    pub field: String,
    pub concept_id: ConceptId,
    pub source: DirectSource,
    pub dictionary_version: DictionaryVersionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Expansion {
    Isa { level: u32 },
    Mapping { mapping_type: String },
}

impl Expansion {
    pub fn kind(&self) -> &'static str {
        match self {
            Expansion::Isa { .. } => "isa",
            Expansion::Mapping { .. } => "mapping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedAnnotation {
    pub item_id: String,
    pub field: String,
    pub concept_id: ConceptId,
    pub expansion: Expansion,
    pub source_concept_id: ConceptId,
}

/// One row of the index: the score of a concept on an item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEntry {
    pub item_id: String,
    pub concept_id: ConceptId,
    pub score: f64,
    /// Position within the item (0 = best), set by the sort pass.
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DictionaryVersion {
    pub id: DictionaryVersionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure() -> Structure {
        Structure {
            resource_id: "GEO".to_string(),
            fields: vec![
                FieldSpec {
                    name: "title".to_string(),
                    weight: 1.0,
                    policy: FieldPolicy::Recognize,
                },
                FieldSpec {
                    name: "summary".to_string(),
                    weight: 0.6,
                    policy: FieldPolicy::Recognize,
                },
            ],
            large: false,
        }
    }

    #[test]
    fn test_validate_accepts_declared_fields() {
        let item = ContentItem::new("GSE1")
            .with_field("title", "heart")
            .with_field("summary", "lung");
        assert_eq!(structure().validate(&item), Ok(()));
    }

    #[test]
    fn test_validate_rejects_undeclared_field() {
        let item = ContentItem::new("GSE1").with_field("authors", "x");
        assert!(matches!(
            structure().validate(&item),
            Err(StructureError::UndeclaredField { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        assert_eq!(
            structure().validate(&ContentItem::new("  ")),
            Err(StructureError::EmptyId)
        );
        assert!(matches!(
            structure().validate(&ContentItem::new("a\tb")),
            Err(StructureError::InvalidId(_))
        ));
    }

    #[test]
    fn test_validate_rejects_repeated_field() {
        let item = ContentItem::new("GSE1")
            .with_field("title", "a")
            .with_field("title", "b");
        assert!(matches!(
            structure().validate(&item),
            Err(StructureError::DuplicateField { .. })
        ));
    }

    #[test]
    fn test_content_hash_changes_with_text() {
        let a = ContentItem::new("GSE1").with_field("title", "heart");
        let b = ContentItem::new("GSE1").with_field("title", "hearts");
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_mapping_is_symmetric() {
        let m = Mapping {
            concept_id: 1,
            mapped_concept_id: 2,
            mapping_type: "exact".to_string(),
        };
        assert_eq!(m.other_side(1), Some(2));
        assert_eq!(m.other_side(2), Some(1));
        assert_eq!(m.other_side(3), None);
    }

    #[test]
    fn test_source_strength() {
        let pref = DirectSource::Matcher {
            term_id: 1,
            preferred: true,
        };
        let syn = DirectSource::Matcher {
            term_id: 2,
            preferred: false,
        };
        assert!(pref.strength() > syn.strength());
        assert_eq!(DirectSource::Reported.strength(), pref.strength());
    }
}
