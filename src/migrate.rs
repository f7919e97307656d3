use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    // Ontology side
    r#"
    CREATE TABLE IF NOT EXISTS ontologies (
        id INTEGER PRIMARY KEY,
        virtual_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        dictionary_version INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concepts (
        id INTEGER PRIMARY KEY,
        ontology_id INTEGER NOT NULL,
        local_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS terms (
        id INTEGER PRIMARY KEY,
        concept_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        preferred INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relations (
        concept_id INTEGER NOT NULL,
        ancestor_id INTEGER NOT NULL,
        level INTEGER NOT NULL,
        PRIMARY KEY (concept_id, ancestor_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mappings (
        concept_id INTEGER NOT NULL,
        mapped_concept_id INTEGER NOT NULL,
        mapping_type TEXT NOT NULL,
        PRIMARY KEY (concept_id, mapped_concept_id, mapping_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dictionary_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    // Resource side
    r#"
    CREATE TABLE IF NOT EXISTS items (
        resource TEXT NOT NULL,
        id TEXT NOT NULL,
        fields_json TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        processed_version INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (resource, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS direct_annotations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        resource TEXT NOT NULL,
        item_id TEXT NOT NULL,
        field TEXT NOT NULL,
        concept_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        term_id INTEGER,
        preferred INTEGER NOT NULL DEFAULT 0,
        dictionary_version INTEGER NOT NULL,
        UNIQUE (resource, item_id, field, concept_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS expanded_annotations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        resource TEXT NOT NULL,
        item_id TEXT NOT NULL,
        field TEXT NOT NULL,
        concept_id INTEGER NOT NULL,
        expansion TEXT NOT NULL,
        level INTEGER,
        mapping_type TEXT,
        source_concept_id INTEGER NOT NULL,
        UNIQUE (resource, item_id, field, concept_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aggregated_entries (
        resource TEXT NOT NULL,
        item_id TEXT NOT NULL,
        concept_id INTEGER NOT NULL,
        score REAL NOT NULL,
        rank INTEGER,
        PRIMARY KEY (resource, item_id, concept_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_watermarks (
        resource TEXT NOT NULL,
        stage TEXT NOT NULL,
        direct_seq INTEGER NOT NULL,
        expanded_seq INTEGER NOT NULL,
        PRIMARY KEY (resource, stage)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_frequency (
        resource TEXT NOT NULL,
        concept_id INTEGER NOT NULL,
        items INTEGER NOT NULL,
        PRIMARY KEY (resource, concept_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_ontologies (
        resource TEXT NOT NULL,
        ontology_id INTEGER NOT NULL,
        dictionary_version INTEGER NOT NULL,
        PRIMARY KEY (resource, ontology_id)
    )
    "#,
    // Indexes
    "CREATE INDEX IF NOT EXISTS idx_ontologies_virtual ON ontologies(virtual_id)",
    "CREATE INDEX IF NOT EXISTS idx_concepts_local ON concepts(ontology_id, local_id)",
    "CREATE INDEX IF NOT EXISTS idx_terms_concept ON terms(concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_relations_ancestor ON relations(ancestor_id)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_mapped ON mappings(mapped_concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_version ON items(resource, processed_version)",
    "CREATE INDEX IF NOT EXISTS idx_direct_item ON direct_annotations(resource, item_id)",
    "CREATE INDEX IF NOT EXISTS idx_direct_concept ON direct_annotations(concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_expanded_item ON expanded_annotations(resource, item_id)",
    "CREATE INDEX IF NOT EXISTS idx_expanded_concept ON expanded_annotations(concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_expanded_source ON expanded_annotations(source_concept_id)",
    "CREATE INDEX IF NOT EXISTS idx_aggregated_concept ON aggregated_entries(concept_id, score DESC)",
];

/// Create every table and index. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
