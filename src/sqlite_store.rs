//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the tables created by
//! [`migrate`](crate::migrate). Multi-row writes run inside one
//! transaction so a failed batch leaves no partial rows behind.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use concept_index_core::models::{
    AggregatedEntry, Concept, ConceptId, ContentItem, DictionaryVersion, DictionaryVersionId,
    DirectAnnotation, DirectSource, ExpandedAnnotation, Expansion, Field, Mapping, Ontology,
    OntologyId, Relation, Term, TermId, TrackedItem, VirtualOntologyId,
};
use concept_index_core::store::{
    ConceptHit, ItemAnnotations, OntologyStats, RemovalReport, Stage, Store, UpsertReport,
    Watermark,
};

/// Active ontology versions: the newest per virtual id.
const ACTIVE_ONTOLOGIES: &str = "SELECT MAX(id) FROM ontologies GROUP BY virtual_id";

/// Maximum bound parameters per `IN (...)` lookup.
const LOOKUP_CHUNK: usize = 500;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ontology_from_row(row: &SqliteRow) -> Ontology {
    Ontology {
        id: row.get("id"),
        virtual_id: row.get("virtual_id"),
        name: row.get("name"),
        version: row.get("version"),
        dictionary_version: row.get("dictionary_version"),
    }
}

fn term_from_row(row: &SqliteRow) -> Term {
    Term {
        id: row.get("id"),
        concept_id: row.get("concept_id"),
        text: row.get("text"),
        preferred: row.get("preferred"),
    }
}

fn version_from_row(row: &SqliteRow) -> DictionaryVersion {
    let created_at: i64 = row.get("created_at");
    DictionaryVersion {
        id: row.get("id"),
        name: row.get("name"),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
    }
}

/// `(source, term_id, preferred)` columns of a direct annotation.
fn source_columns(source: &DirectSource) -> (&'static str, Option<TermId>, bool) {
    match source {
        DirectSource::Matcher { term_id, preferred } => ("matcher", Some(*term_id), *preferred),
        DirectSource::Reported => ("reported", None, false),
    }
}

fn source_from_columns(source: &str, term_id: Option<TermId>, preferred: bool) -> Result<DirectSource> {
    match source {
        "matcher" => Ok(DirectSource::Matcher {
            term_id: term_id.unwrap_or_default(),
            preferred,
        }),
        "reported" => Ok(DirectSource::Reported),
        other => bail!("unknown direct annotation source '{}'", other),
    }
}

fn direct_from_row(row: &SqliteRow) -> Result<DirectAnnotation> {
    let source: String = row.get("source");
    Ok(DirectAnnotation {
        item_id: row.get("item_id"),
        field: row.get("field"),
        concept_id: row.get("concept_id"),
        source: source_from_columns(&source, row.get("term_id"), row.get("preferred"))?,
        dictionary_version: row.get("dictionary_version"),
    })
}

/// `(expansion, level, mapping_type)` columns of an expanded annotation.
fn expansion_columns(expansion: &Expansion) -> (&'static str, Option<i64>, Option<&str>) {
    match expansion {
        Expansion::Isa { level } => ("isa", Some(i64::from(*level)), None),
        Expansion::Mapping { mapping_type } => ("mapping", None, Some(mapping_type.as_str())),
    }
}

fn expanded_from_row(row: &SqliteRow) -> Result<ExpandedAnnotation> {
    let kind: String = row.get("expansion");
    let expansion = match kind.as_str() {
        "isa" => {
            let level: Option<i64> = row.get("level");
            Expansion::Isa {
                level: u32::try_from(level.unwrap_or_default()).unwrap_or(u32::MAX),
            }
        }
        "mapping" => {
            let mapping_type: Option<String> = row.get("mapping_type");
            Expansion::Mapping {
                mapping_type: mapping_type.unwrap_or_default(),
            }
        }
        other => bail!("unknown expansion kind '{}'", other),
    };
    Ok(ExpandedAnnotation {
        item_id: row.get("item_id"),
        field: row.get("field"),
        concept_id: row.get("concept_id"),
        expansion,
        source_concept_id: row.get("source_concept_id"),
    })
}

fn entry_from_row(row: &SqliteRow) -> AggregatedEntry {
    let rank: Option<i64> = row.get("rank");
    AggregatedEntry {
        item_id: row.get("item_id"),
        concept_id: row.get("concept_id"),
        score: row.get("score"),
        rank: rank.and_then(|r| u32::try_from(r).ok()),
    }
}

fn stats_for(stats: &mut BTreeMap<OntologyId, OntologyStats>, o: OntologyId) -> &mut OntologyStats {
    stats.entry(o).or_insert_with(|| OntologyStats {
        ontology_id: o,
        ..Default::default()
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_ontologies(&self, ontologies: &[Ontology]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for o in ontologies {
            sqlx::query(
                r#"
                INSERT INTO ontologies (id, virtual_id, name, version, dictionary_version)
                VALUES (?, ?, ?, ?, NULL)
                ON CONFLICT(id) DO UPDATE SET
                    virtual_id = excluded.virtual_id,
                    name = excluded.name,
                    version = excluded.version
                "#,
            )
            .bind(o.id)
            .bind(o.virtual_id)
            .bind(&o.name)
            .bind(&o.version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(ontologies.len())
    }

    async fn insert_concepts(&self, concepts: &[Concept]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for c in concepts {
            n += sqlx::query(
                "INSERT OR IGNORE INTO concepts (id, ontology_id, local_id) VALUES (?, ?, ?)",
            )
            .bind(c.id)
            .bind(c.ontology_id)
            .bind(&c.local_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn insert_terms(&self, terms: &[Term]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for t in terms {
            n += sqlx::query(
                "INSERT OR IGNORE INTO terms (id, concept_id, text, preferred) VALUES (?, ?, ?, ?)",
            )
            .bind(t.id)
            .bind(t.concept_id)
            .bind(&t.text)
            .bind(t.preferred)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn insert_relations(&self, relations: &[Relation]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for r in relations {
            n += sqlx::query(
                "INSERT OR IGNORE INTO relations (concept_id, ancestor_id, level) VALUES (?, ?, ?)",
            )
            .bind(r.concept_id)
            .bind(r.ancestor_id)
            .bind(i64::from(r.level))
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for m in mappings {
            n += sqlx::query(
                "INSERT OR IGNORE INTO mappings (concept_id, mapped_concept_id, mapping_type) VALUES (?, ?, ?)",
            )
            .bind(m.concept_id)
            .bind(m.mapped_concept_id)
            .bind(&m.mapping_type)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn ontologies(&self) -> Result<Vec<Ontology>> {
        let rows = sqlx::query(
            "SELECT id, virtual_id, name, version, dictionary_version FROM ontologies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(ontology_from_row).collect())
    }

    async fn latest_ontology(&self, virtual_id: VirtualOntologyId) -> Result<Option<Ontology>> {
        let row = sqlx::query(
            r#"
            SELECT id, virtual_id, name, version, dictionary_version FROM ontologies
            WHERE virtual_id = ? ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(virtual_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ontology_from_row))
    }

    async fn concept(&self, id: ConceptId) -> Result<Option<Concept>> {
        let row = sqlx::query("SELECT id, ontology_id, local_id FROM concepts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Concept {
            id: r.get("id"),
            ontology_id: r.get("ontology_id"),
            local_id: r.get("local_id"),
        }))
    }

    async fn find_concept(
        &self,
        ontology_id: OntologyId,
        local_id: &str,
    ) -> Result<Option<Concept>> {
        let row = sqlx::query(
            "SELECT id, ontology_id, local_id FROM concepts WHERE ontology_id = ? AND local_id = ? LIMIT 1",
        )
        .bind(ontology_id)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Concept {
            id: r.get("id"),
            ontology_id: r.get("ontology_id"),
            local_id: r.get("local_id"),
        }))
    }

    async fn terms(&self, ids: &[TermId]) -> Result<Vec<Term>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT id, concept_id, text, preferred FROM terms WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            out.extend(rows.iter().map(term_from_row));
        }
        Ok(out)
    }

    async fn dictionary_terms(&self, newer_than: Option<DictionaryVersionId>) -> Result<Vec<Term>> {
        let sql = format!(
            r#"
            SELECT t.id, t.concept_id, t.text, t.preferred
            FROM terms t
            JOIN concepts c ON c.id = t.concept_id
            JOIN ontologies o ON o.id = c.ontology_id
            WHERE o.id IN ({})
              AND o.dictionary_version IS NOT NULL
              AND (? IS NULL OR o.dictionary_version > ?)
            ORDER BY t.id
            "#,
            ACTIVE_ONTOLOGIES
        );
        let rows = sqlx::query(&sql)
            .bind(newer_than)
            .bind(newer_than)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(term_from_row).collect())
    }

    async fn ancestors(&self, concept: ConceptId) -> Result<Vec<Relation>> {
        let rows = sqlx::query(
            "SELECT concept_id, ancestor_id, level FROM relations WHERE concept_id = ? ORDER BY level, ancestor_id",
        )
        .bind(concept)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let level: i64 = r.get("level");
                Relation {
                    concept_id: r.get("concept_id"),
                    ancestor_id: r.get("ancestor_id"),
                    level: u32::try_from(level).unwrap_or(u32::MAX),
                }
            })
            .collect())
    }

    async fn mappings(&self, concept: ConceptId) -> Result<Vec<Mapping>> {
        let rows = sqlx::query(
            r#"
            SELECT concept_id, mapped_concept_id, mapping_type FROM mappings
            WHERE concept_id = ? OR mapped_concept_id = ?
            ORDER BY concept_id, mapped_concept_id, mapping_type
            "#,
        )
        .bind(concept)
        .bind(concept)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Mapping {
                concept_id: r.get("concept_id"),
                mapped_concept_id: r.get("mapped_concept_id"),
                mapping_type: r.get("mapping_type"),
            })
            .collect())
    }

    async fn remove_ontology(&self, ontology_id: OntologyId) -> Result<Option<RemovalReport>> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM ontologies WHERE id = ?")
            .bind(ontology_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Ok(None);
        }

        const DOOMED: &str = "SELECT id FROM concepts WHERE ontology_id = ?";
        let mut report = RemovalReport {
            ontology_id,
            ..Default::default()
        };

        let affected = sqlx::query(&format!(
            r#"
            SELECT resource, item_id FROM direct_annotations WHERE concept_id IN ({d})
            UNION
            SELECT resource, item_id FROM expanded_annotations
            WHERE concept_id IN ({d}) OR source_concept_id IN ({d})
            ORDER BY 1, 2
            "#,
            d = DOOMED
        ))
        .bind(ontology_id)
        .bind(ontology_id)
        .bind(ontology_id)
        .fetch_all(&mut *tx)
        .await?;
        report.affected_items = affected
            .iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1)))
            .collect();

        report.terms = sqlx::query(&format!("DELETE FROM terms WHERE concept_id IN ({})", DOOMED))
            .bind(ontology_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        report.relations = sqlx::query(&format!(
            "DELETE FROM relations WHERE concept_id IN ({d}) OR ancestor_id IN ({d})",
            d = DOOMED
        ))
        .bind(ontology_id)
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
        report.mappings = sqlx::query(&format!(
            "DELETE FROM mappings WHERE concept_id IN ({d}) OR mapped_concept_id IN ({d})",
            d = DOOMED
        ))
        .bind(ontology_id)
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
        report.direct = sqlx::query(&format!(
            "DELETE FROM direct_annotations WHERE concept_id IN ({})",
            DOOMED
        ))
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
        report.expanded = sqlx::query(&format!(
            "DELETE FROM expanded_annotations WHERE concept_id IN ({d}) OR source_concept_id IN ({d})",
            d = DOOMED
        ))
        .bind(ontology_id)
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
        report.aggregated = sqlx::query(&format!(
            "DELETE FROM aggregated_entries WHERE concept_id IN ({})",
            DOOMED
        ))
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
        sqlx::query(&format!(
            "DELETE FROM concept_frequency WHERE concept_id IN ({})",
            DOOMED
        ))
        .bind(ontology_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM resource_ontologies WHERE ontology_id = ?")
            .bind(ontology_id)
            .execute(&mut *tx)
            .await?;
        report.concepts = sqlx::query("DELETE FROM concepts WHERE ontology_id = ?")
            .bind(ontology_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        sqlx::query("DELETE FROM ontologies WHERE id = ?")
            .bind(ontology_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(report))
    }

    async fn latest_dictionary_version(&self) -> Result<Option<DictionaryVersion>> {
        let row = sqlx::query(
            "SELECT id, name, created_at FROM dictionary_versions ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(version_from_row))
    }

    async fn create_dictionary_version(&self, name: &str) -> Result<DictionaryVersion> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query("INSERT INTO dictionary_versions (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        sqlx::query("UPDATE ontologies SET dictionary_version = ? WHERE dictionary_version IS NULL")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DictionaryVersion {
            id,
            name: name.to_string(),
            created_at: DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now),
        })
    }

    async fn upsert_items(&self, resource: &str, items: &[ContentItem]) -> Result<UpsertReport> {
        let now = Utc::now().timestamp();
        let mut report = UpsertReport::default();
        let mut tx = self.pool.begin().await?;
        for item in items {
            let hash = item.content_hash();
            let fields_json = serde_json::to_string(&item.fields)?;
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT content_hash FROM items WHERE resource = ? AND id = ?",
            )
            .bind(resource)
            .bind(&item.id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(h) if h == hash => report.unchanged += 1,
                Some(_) => {
                    for table in ["direct_annotations", "expanded_annotations", "aggregated_entries"] {
                        sqlx::query(&format!(
                            "DELETE FROM {} WHERE resource = ? AND item_id = ?",
                            table
                        ))
                        .bind(resource)
                        .bind(&item.id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    sqlx::query(
                        r#"
                        UPDATE items SET fields_json = ?, content_hash = ?,
                            processed_version = 0, updated_at = ?
                        WHERE resource = ? AND id = ?
                        "#,
                    )
                    .bind(&fields_json)
                    .bind(&hash)
                    .bind(now)
                    .bind(resource)
                    .bind(&item.id)
                    .execute(&mut *tx)
                    .await?;
                    report.changed += 1;
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO items (resource, id, fields_json, content_hash, processed_version, updated_at)
                        VALUES (?, ?, ?, ?, 0, ?)
                        "#,
                    )
                    .bind(resource)
                    .bind(&item.id)
                    .bind(&fields_json)
                    .bind(&hash)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    report.inserted += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn item_ids(&self, resource: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM items WHERE resource = ? ORDER BY id")
            .bind(resource)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn items_below_version(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, fields_json, processed_version FROM items
            WHERE resource = ? AND processed_version < ?
            ORDER BY id
            "#,
        )
        .bind(resource)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let fields_json: String = row.get("fields_json");
            let fields: Vec<Field> = serde_json::from_str(&fields_json)
                .with_context(|| format!("corrupt fields for item {}/{}", resource, id))?;
            out.push(TrackedItem {
                item: ContentItem { id, fields },
                processed_version: row.get("processed_version"),
            });
        }
        Ok(out)
    }

    async fn processed_version(
        &self,
        resource: &str,
        item_id: &str,
    ) -> Result<Option<DictionaryVersionId>> {
        let v = sqlx::query_scalar(
            "SELECT processed_version FROM items WHERE resource = ? AND id = ?",
        )
        .bind(resource)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(v)
    }

    async fn set_processed_version(
        &self,
        resource: &str,
        item_ids: &[String],
        version: DictionaryVersionId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in item_ids {
            sqlx::query("UPDATE items SET processed_version = ? WHERE resource = ? AND id = ?")
                .bind(version)
                .bind(resource)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_direct(&self, resource: &str, rows: &[DirectAnnotation]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for row in rows {
            let existing = sqlx::query(
                r#"
                SELECT seq, source, term_id, preferred FROM direct_annotations
                WHERE resource = ? AND item_id = ? AND field = ? AND concept_id = ?
                "#,
            )
            .bind(resource)
            .bind(&row.item_id)
            .bind(&row.field)
            .bind(row.concept_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing) = existing {
                let source: String = existing.get("source");
                let current =
                    source_from_columns(&source, existing.get("term_id"), existing.get("preferred"))?;
                if current.strength() >= row.source.strength() {
                    continue;
                }
                let seq: i64 = existing.get("seq");
                sqlx::query("DELETE FROM direct_annotations WHERE seq = ?")
                    .bind(seq)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query(
                r#"
                DELETE FROM expanded_annotations
                WHERE resource = ? AND item_id = ? AND field = ? AND concept_id = ?
                "#,
            )
            .bind(resource)
            .bind(&row.item_id)
            .bind(&row.field)
            .bind(row.concept_id)
            .execute(&mut *tx)
            .await?;

            let (source, term_id, preferred) = source_columns(&row.source);
            sqlx::query(
                r#"
                INSERT INTO direct_annotations
                    (resource, item_id, field, concept_id, source, term_id, preferred, dictionary_version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(resource)
            .bind(&row.item_id)
            .bind(&row.field)
            .bind(row.concept_id)
            .bind(source)
            .bind(term_id)
            .bind(preferred)
            .bind(row.dictionary_version)
            .execute(&mut *tx)
            .await?;
            n += 1;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn direct_since(
        &self,
        resource: &str,
        after: i64,
    ) -> Result<Vec<(i64, DirectAnnotation)>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, item_id, field, concept_id, source, term_id, preferred, dictionary_version
            FROM direct_annotations
            WHERE resource = ? AND seq > ?
            ORDER BY seq
            "#,
        )
        .bind(resource)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<(i64, DirectAnnotation)> { Ok((r.get("seq"), direct_from_row(r)?)) })
            .collect()
    }

    async fn insert_expanded(&self, resource: &str, rows: &[ExpandedAnnotation]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for row in rows {
            let (kind, level, mapping_type) = expansion_columns(&row.expansion);
            n += sqlx::query(
                r#"
                INSERT OR IGNORE INTO expanded_annotations
                    (resource, item_id, field, concept_id, expansion, level, mapping_type, source_concept_id)
                SELECT ?, ?, ?, ?, ?, ?, ?, ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM direct_annotations
                    WHERE resource = ? AND item_id = ? AND field = ? AND concept_id = ?
                )
                "#,
            )
            .bind(resource)
            .bind(&row.item_id)
            .bind(&row.field)
            .bind(row.concept_id)
            .bind(kind)
            .bind(level)
            .bind(mapping_type)
            .bind(row.source_concept_id)
            .bind(resource)
            .bind(&row.item_id)
            .bind(&row.field)
            .bind(row.concept_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn annotation_high_water(&self, resource: &str) -> Result<Watermark> {
        let direct: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM direct_annotations WHERE resource = ?",
        )
        .bind(resource)
        .fetch_one(&self.pool)
        .await?;
        let expanded: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM expanded_annotations WHERE resource = ?",
        )
        .bind(resource)
        .fetch_one(&self.pool)
        .await?;
        Ok(Watermark { direct, expanded })
    }

    async fn items_annotated_since(&self, resource: &str, mark: Watermark) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT item_id FROM direct_annotations WHERE resource = ? AND seq > ?
            UNION
            SELECT item_id FROM expanded_annotations WHERE resource = ? AND seq > ?
            ORDER BY 1
            "#,
        )
        .bind(resource)
        .bind(mark.direct)
        .bind(resource)
        .bind(mark.expanded)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn item_annotations(&self, resource: &str, item_id: &str) -> Result<ItemAnnotations> {
        let direct = sqlx::query(
            r#"
            SELECT item_id, field, concept_id, source, term_id, preferred, dictionary_version
            FROM direct_annotations WHERE resource = ? AND item_id = ? ORDER BY seq
            "#,
        )
        .bind(resource)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        let expanded = sqlx::query(
            r#"
            SELECT item_id, field, concept_id, expansion, level, mapping_type, source_concept_id
            FROM expanded_annotations WHERE resource = ? AND item_id = ? ORDER BY seq
            "#,
        )
        .bind(resource)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ItemAnnotations {
            direct: direct.iter().map(direct_from_row).collect::<Result<_>>()?,
            expanded: expanded.iter().map(expanded_from_row).collect::<Result<_>>()?,
        })
    }

    async fn watermark(&self, resource: &str, stage: Stage) -> Result<Watermark> {
        let row = sqlx::query(
            "SELECT direct_seq, expanded_seq FROM stage_watermarks WHERE resource = ? AND stage = ?",
        )
        .bind(resource)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| Watermark {
                direct: r.get("direct_seq"),
                expanded: r.get("expanded_seq"),
            })
            .unwrap_or_default())
    }

    async fn set_watermark(&self, resource: &str, stage: Stage, mark: Watermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_watermarks (resource, stage, direct_seq, expanded_seq)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource, stage) DO UPDATE SET
                direct_seq = excluded.direct_seq,
                expanded_seq = excluded.expanded_seq
            "#,
        )
        .bind(resource)
        .bind(stage.as_str())
        .bind(mark.direct)
        .bind(mark.expanded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_aggregates(
        &self,
        resource: &str,
        item_id: &str,
        entries: &[AggregatedEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM aggregated_entries WHERE resource = ? AND item_id = ?")
            .bind(resource)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        for e in entries {
            sqlx::query(
                "INSERT INTO aggregated_entries (resource, item_id, concept_id, score, rank) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(resource)
            .bind(item_id)
            .bind(e.concept_id)
            .bind(e.score)
            .bind(e.rank.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn aggregates(&self, resource: &str, item_id: &str) -> Result<Vec<AggregatedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, concept_id, score, rank FROM aggregated_entries
            WHERE resource = ? AND item_id = ?
            ORDER BY rank IS NULL, rank, concept_id
            "#,
        )
        .bind(resource)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    async fn aggregated_item_ids(&self, resource: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT DISTINCT item_id FROM aggregated_entries WHERE resource = ? ORDER BY item_id",
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn clear_aggregates(&self, resource: &str) -> Result<usize> {
        let n = sqlx::query("DELETE FROM aggregated_entries WHERE resource = ?")
            .bind(resource)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n as usize)
    }

    async fn entries_for_concept(
        &self,
        concept: ConceptId,
        resource: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConceptHit>> {
        let rows = sqlx::query(
            r#"
            SELECT resource, item_id, concept_id, score, rank FROM aggregated_entries
            WHERE concept_id = ? AND (? IS NULL OR resource = ?)
            ORDER BY score DESC, resource, item_id
            LIMIT ?
            "#,
        )
        .bind(concept)
        .bind(resource)
        .bind(resource)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ConceptHit {
                resource: r.get("resource"),
                entry: entry_from_row(r),
            })
            .collect())
    }

    async fn recompute_concept_frequency(&self, resource: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM concept_frequency WHERE resource = ?")
            .bind(resource)
            .execute(&mut *tx)
            .await?;
        let n = sqlx::query(
            r#"
            INSERT INTO concept_frequency (resource, concept_id, items)
            SELECT ?, concept_id, COUNT(DISTINCT item_id)
            FROM aggregated_entries
            WHERE resource = ? AND score > 0
            GROUP BY concept_id
            "#,
        )
        .bind(resource)
        .bind(resource)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(n as usize)
    }

    async fn concept_frequency(&self, resource: &str) -> Result<Vec<(ConceptId, i64)>> {
        let rows = sqlx::query(
            "SELECT concept_id, items FROM concept_frequency WHERE resource = ? ORDER BY concept_id",
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("concept_id"), r.get("items")))
            .collect())
    }

    async fn annotation_stats(&self, resource: &str) -> Result<Vec<OntologyStats>> {
        let mut stats: BTreeMap<OntologyId, OntologyStats> = BTreeMap::new();

        let direct = sqlx::query(
            r#"
            SELECT c.ontology_id AS ontology_id, d.source AS kind, COUNT(*) AS n
            FROM direct_annotations d JOIN concepts c ON c.id = d.concept_id
            WHERE d.resource = ?
            GROUP BY c.ontology_id, d.source
            "#,
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        for r in &direct {
            let kind: String = r.get("kind");
            let n: i64 = r.get("n");
            let s = stats_for(&mut stats, r.get("ontology_id"));
            match kind.as_str() {
                "reported" => s.reported += n,
                _ => s.matcher += n,
            }
        }

        let expanded = sqlx::query(
            r#"
            SELECT c.ontology_id AS ontology_id, e.expansion AS kind, COUNT(*) AS n
            FROM expanded_annotations e JOIN concepts c ON c.id = e.concept_id
            WHERE e.resource = ?
            GROUP BY c.ontology_id, e.expansion
            "#,
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        for r in &expanded {
            let kind: String = r.get("kind");
            let n: i64 = r.get("n");
            let s = stats_for(&mut stats, r.get("ontology_id"));
            match kind.as_str() {
                "isa" => s.isa += n,
                _ => s.mapping += n,
            }
        }

        let aggregated = sqlx::query(
            r#"
            SELECT c.ontology_id AS ontology_id, COUNT(*) AS n
            FROM aggregated_entries a JOIN concepts c ON c.id = a.concept_id
            WHERE a.resource = ?
            GROUP BY c.ontology_id
            "#,
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        for r in &aggregated {
            let n: i64 = r.get("n");
            stats_for(&mut stats, r.get("ontology_id")).aggregated += n;
        }

        Ok(stats.into_values().collect())
    }

    async fn resources(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT DISTINCT resource FROM items ORDER BY resource")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn record_resource_ontologies(
        &self,
        resource: &str,
        version: DictionaryVersionId,
    ) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT OR IGNORE INTO resource_ontologies (resource, ontology_id, dictionary_version)
            SELECT ?, id, ? FROM ontologies
            WHERE id IN ({})
              AND dictionary_version IS NOT NULL
              AND dictionary_version <= ?
            "#,
            ACTIVE_ONTOLOGIES
        ))
        .bind(resource)
        .bind(version)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resource_ontologies(
        &self,
        resource: &str,
    ) -> Result<Vec<(OntologyId, DictionaryVersionId)>> {
        let rows = sqlx::query(
            "SELECT ontology_id, dictionary_version FROM resource_ontologies WHERE resource = ? ORDER BY ontology_id",
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("ontology_id"), r.get("dictionary_version")))
            .collect())
    }
}
