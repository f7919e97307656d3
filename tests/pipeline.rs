//! End-to-end pipeline runs against the SQLite store.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use concept_index::config::{
    Config, DbConfig, DictionaryConfig, ExpansionConfig, MatcherConfig, RecognitionConfig,
};
use concept_index::ingest::run_resource;
use concept_index::loader::{self, OntologyBundle};
use concept_index::progress::NoProgress;
use concept_index::sqlite_store::SqliteStore;
use concept_index::traits::ContentConnector;
use concept_index::{db, migrate};
use concept_index_core::aggregate::Aggregator;
use concept_index_core::error::MatcherError;
use concept_index_core::matcher::{MatchHit, MatchRequest, Matcher};
use concept_index_core::models::{
    AggregatedEntry, ContentItem, DirectAnnotation, DirectSource, FieldPolicy, FieldSpec,
    Structure,
};
use concept_index_core::scoring::Weights;
use concept_index_core::store::Store;

/// Hits every dictionary term whose text occurs in the request text.
struct ContainsMatcher;

#[async_trait]
impl Matcher for ContainsMatcher {
    async fn match_batch(
        &self,
        dictionary: &Path,
        batch: &[MatchRequest],
    ) -> std::result::Result<Vec<MatchHit>, MatcherError> {
        let dict = std::fs::read_to_string(dictionary)?;
        let mut hits = Vec::new();
        for req in batch {
            let text = req.text.to_lowercase();
            for line in dict.lines() {
                let (id, term) = line.split_once('\t').unwrap();
                if text.contains(&term.to_lowercase()) {
                    hits.push(MatchHit {
                        item_id: req.item_id.clone(),
                        field: req.field.clone(),
                        term_id: id.parse().unwrap(),
                    });
                }
            }
        }
        Ok(hits)
    }
}

struct FixedConnector {
    structure: Structure,
    items: Mutex<Vec<ContentItem>>,
}

#[async_trait]
impl ContentConnector for FixedConnector {
    fn resource_id(&self) -> &str {
        &self.structure.resource_id
    }
    fn description(&self) -> &str {
        "fixed items"
    }
    fn describe_structure(&self) -> &Structure {
        &self.structure
    }
    async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>> {
        Ok(self.items.lock().unwrap().clone())
    }
}

fn field(name: &str, weight: f64, policy: FieldPolicy) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        weight,
        policy,
    }
}

fn config(dir: &Path) -> Config {
    Config {
        db: DbConfig {
            path: dir.join("cidx.sqlite"),
        },
        dictionary: DictionaryConfig {
            dir: dir.join("dictionaries"),
            with_complete_dictionary: false,
            denylist: vec![],
        },
        matcher: MatcherConfig {
            command: "unused".to_string(),
            args: vec![],
            timeout_secs: 5,
            batch_size: 10,
            work_dir: None,
        },
        recognition: RecognitionConfig::default(),
        expansion: ExpansionConfig::default(),
        weights: Weights {
            preferred_name_da: 8.0,
            synonym_da: 6.0,
            ..Default::default()
        },
        resources: Default::default(),
    }
}

async fn open_store(cfg: &Config) -> SqliteStore {
    let pool = db::connect(cfg).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    SqliteStore::new(pool)
}

fn bundle() -> OntologyBundle {
    OntologyBundle {
        ontologies: loader::parse_ontologies("1\t100\tAnatomy\t1\n2\t200\tDisease\t1\n").unwrap(),
        concepts: loader::parse_concepts(
            "100\t1\tA:heart\n101\t1\tA:organ\n200\t2\tD:cardiomyopathy\n300\t2\tD:lung\n",
        )
        .unwrap(),
        terms: loader::parse_terms(
            "1\t100\theart\t1\n2\t200\tcardiomyopathy\t0\n3\t101\torgan\t1\n",
        )
        .unwrap(),
        relations: loader::parse_relations("100\t101\t1\n").unwrap(),
        mappings: loader::parse_mappings("100\t300\trelated\n").unwrap(),
    }
}

/// The same concepts as [`bundle`], split into the Anatomy and Disease
/// versions so they can be loaded one after the other. Disease also
/// relates its concept to Anatomy's heart.
fn anatomy_bundle() -> OntologyBundle {
    OntologyBundle {
        ontologies: loader::parse_ontologies("1\t100\tAnatomy\t1\n").unwrap(),
        concepts: loader::parse_concepts("100\t1\tA:heart\n101\t1\tA:organ\n").unwrap(),
        terms: loader::parse_terms("1\t100\theart\t1\n3\t101\torgan\t1\n").unwrap(),
        relations: loader::parse_relations("100\t101\t1\n").unwrap(),
        mappings: vec![],
    }
}

fn disease_bundle() -> OntologyBundle {
    OntologyBundle {
        ontologies: loader::parse_ontologies("2\t200\tDisease\t1\n").unwrap(),
        concepts: loader::parse_concepts("200\t2\tD:cardiomyopathy\n300\t2\tD:lung\n")
            .unwrap(),
        terms: loader::parse_terms("2\t200\tcardiomyopathy\t0\n").unwrap(),
        relations: loader::parse_relations("200\t100\t1\n").unwrap(),
        mappings: loader::parse_mappings("100\t300\trelated\n").unwrap(),
    }
}

fn connector(items: Vec<ContentItem>) -> FixedConnector {
    FixedConnector {
        structure: Structure {
            resource_id: "GEO".to_string(),
            fields: vec![
                field("title", 1.0, FieldPolicy::Recognize),
                field("abstract", 0.6, FieldPolicy::Recognize),
                field("organ", 0.5, FieldPolicy::Reported { ontology: 100 }),
            ],
            large: false,
        },
        items: Mutex::new(items),
    }
}

fn e1_connector() -> FixedConnector {
    connector(vec![ContentItem::new("E1")
        .with_field("title", "The heart")
        .with_field("abstract", "Dilated cardiomyopathy")])
}

/// Annotations of an item without their dictionary versions, sorted.
async fn annotation_rows(store: &SqliteStore, item: &str) -> Vec<String> {
    let ann = store.item_annotations("GEO", item).await.unwrap();
    let mut rows: Vec<String> = ann
        .direct
        .iter()
        .map(|d| format!("direct {} {} {:?}", d.field, d.concept_id, d.source))
        .chain(ann.expanded.iter().map(|e| {
            format!(
                "expanded {} {} {:?} from {}",
                e.field, e.concept_id, e.expansion, e.source_concept_id
            )
        }))
        .collect();
    rows.sort();
    rows
}

async fn score(store: &SqliteStore, item: &str, concept: i64) -> Option<f64> {
    store
        .aggregates("GEO", item)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.concept_id == concept)
        .map(|e| e.score)
}

#[tokio::test]
async fn test_weighted_scores_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &bundle()).await.unwrap();

    let source = e1_connector();
    let summary = run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.recognition.items_done, 1);

    assert_eq!(score(&store, "E1", 100).await, Some(8.0));
    let synonym = score(&store, "E1", 200).await.unwrap();
    assert!((synonym - 3.6).abs() < 1e-9, "got {}", synonym);

    // Is-a parent of heart (stepwise level 1 = 8) and the mapped concept
    // (mapping_ea = 7) come from the title only.
    assert_eq!(score(&store, "E1", 101).await, Some(8.0));
    assert_eq!(score(&store, "E1", 300).await, Some(7.0));

    let ranked = store.aggregates("GEO", "E1").await.unwrap();
    assert!(ranked.iter().all(|e| e.rank.is_some()));
    assert_eq!(ranked[0].rank, Some(0));
}

#[tokio::test]
async fn test_rerun_is_noop() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &bundle()).await.unwrap();
    let source = e1_connector();

    run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    let before = store.aggregates("GEO", "E1").await.unwrap();

    let again = run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.upsert.unchanged, 1);
    assert_eq!(again.recognition.items_done, 0);
    assert_eq!(again.expansion.total(), 0);
    assert_eq!(store.aggregates("GEO", "E1").await.unwrap(), before);
}

#[tokio::test]
async fn test_reported_field_and_changed_item() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &bundle()).await.unwrap();
    let source = e1_connector();
    run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();

    *source.items.lock().unwrap() = vec![ContentItem::new("E1")
        .with_field("title", "Unrelated")
        .with_field("organ", "A:organ; A:missing")];
    let summary = run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.upsert.changed, 1);
    assert_eq!(summary.recognition.reported_annotations, 1);

    let entries = store.aggregates("GEO", "E1").await.unwrap();
    let concepts: Vec<i64> = entries.iter().map(|e| e.concept_id).collect();
    // Reported ids weigh like preferred names: 0.5 * 8.
    assert_eq!(concepts, vec![101]);
    assert_eq!(entries[0].score, 4.0);
}

#[tokio::test]
async fn test_remove_ontology_cascades() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &bundle()).await.unwrap();
    let source = e1_connector();
    run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();

    let removal = store.remove_ontology(2).await.unwrap().unwrap();
    assert_eq!(removal.concepts, 2);
    assert_eq!(
        removal.affected_items,
        vec![("GEO".to_string(), "E1".to_string())]
    );
    Aggregator::new(&store, &cfg.weights)
        .after_removal(
            &[source.structure.clone()],
            &cfg.expansion_options(),
            &removal,
        )
        .await
        .unwrap();

    for table in [
        "direct_annotations",
        "expanded_annotations",
        "aggregated_entries",
        "concept_frequency",
    ] {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE concept_id IN (200, 300)",
            table
        );
        let n: i64 = sqlx::query_scalar(&sql)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n, 0, "{} still references retired concepts", table);
    }
    let mapped: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM mappings WHERE concept_id IN (200, 300) OR mapped_concept_id IN (200, 300)",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(mapped, 0);

    // Anatomy survives untouched.
    assert_eq!(score(&store, "E1", 100).await, Some(8.0));
    assert!(store.remove_ontology(2).await.unwrap().is_none());
}

#[tokio::test]
async fn test_direct_row_displaces_expanded_row() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &bundle()).await.unwrap();
    let source = e1_connector();
    run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(score(&store, "E1", 101).await, Some(8.0));

    // Organ now matched on the title as a synonym.
    store
        .insert_direct(
            "GEO",
            &[DirectAnnotation {
                item_id: "E1".to_string(),
                field: "title".to_string(),
                concept_id: 101,
                source: DirectSource::Matcher {
                    term_id: 3,
                    preferred: false,
                },
                dictionary_version: 1,
            }],
        )
        .await
        .unwrap();
    let expanded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM expanded_annotations WHERE item_id = 'E1' AND field = 'title' AND concept_id = 101",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(expanded, 0);

    Aggregator::new(&store, &cfg.weights)
        .aggregate(&source.structure)
        .await
        .unwrap();
    assert_eq!(score(&store, "E1", 101).await, Some(6.0));
}

#[tokio::test]
async fn test_incremental_ontology_matches_fresh_build() {
    let source = e1_connector();

    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &anatomy_bundle()).await.unwrap();
    let first = run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(first.version, 1);

    loader::load_bundle(&store, &disease_bundle()).await.unwrap();
    let second = run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(second.version, 2);
    assert!(second.opened_version);
    assert_eq!(second.recognition.matcher_annotations, 1);
    assert!(tmp
        .path()
        .join("dictionaries/dictionary_v2_since_v1.tsv")
        .exists());

    let fresh_tmp = TempDir::new().unwrap();
    let fresh_cfg = config(fresh_tmp.path());
    let fresh = open_store(&fresh_cfg).await;
    loader::load_bundle(&fresh, &anatomy_bundle()).await.unwrap();
    loader::load_bundle(&fresh, &disease_bundle()).await.unwrap();
    run_resource(&fresh_cfg, &fresh, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();

    assert_eq!(
        annotation_rows(&store, "E1").await,
        annotation_rows(&fresh, "E1").await
    );
    let incremental: Vec<AggregatedEntry> = store.aggregates("GEO", "E1").await.unwrap();
    assert_eq!(incremental, fresh.aggregates("GEO", "E1").await.unwrap());

    // The mapping loaded with Disease reaches heart's title annotation
    // from the first pass.
    assert_eq!(score(&store, "E1", 300).await, Some(7.0));
    let heart = score(&store, "E1", 100).await.unwrap();
    assert!((heart - 12.8).abs() < 1e-9, "got {}", heart);
}

#[tokio::test]
async fn test_removal_matches_fresh_build_without_ontology() {
    let carditis = OntologyBundle {
        ontologies: loader::parse_ontologies("2\t200\tDisease\t1\n").unwrap(),
        concepts: loader::parse_concepts("90\t2\tD:carditis\n").unwrap(),
        terms: loader::parse_terms("5\t90\tcarditis\t1\n").unwrap(),
        relations: loader::parse_relations("90\t101\t2\n").unwrap(),
        mappings: vec![],
    };
    let source = connector(vec![
        ContentItem::new("E2").with_field("title", "Heart carditis")
    ]);

    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path());
    let store = open_store(&cfg).await;
    loader::load_bundle(&store, &anatomy_bundle()).await.unwrap();
    loader::load_bundle(&store, &carditis).await.unwrap();
    run_resource(&cfg, &store, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();
    // Carditis (90) is stored before heart (100), so organ comes in at
    // level 2 through it.
    assert_eq!(score(&store, "E2", 101).await, Some(7.0));

    let removal = store.remove_ontology(2).await.unwrap().unwrap();
    Aggregator::new(&store, &cfg.weights)
        .after_removal(
            &[source.structure.clone()],
            &cfg.expansion_options(),
            &removal,
        )
        .await
        .unwrap();
    assert_eq!(score(&store, "E2", 101).await, Some(8.0));

    let fresh_tmp = TempDir::new().unwrap();
    let fresh_cfg = config(fresh_tmp.path());
    let fresh = open_store(&fresh_cfg).await;
    loader::load_bundle(&fresh, &anatomy_bundle()).await.unwrap();
    run_resource(&fresh_cfg, &fresh, &ContainsMatcher, &source, false, &NoProgress)
        .await
        .unwrap();

    assert_eq!(
        annotation_rows(&store, "E2").await,
        annotation_rows(&fresh, "E2").await
    );
    assert_eq!(
        store.aggregates("GEO", "E2").await.unwrap(),
        fresh.aggregates("GEO", "E2").await.unwrap()
    );
}
