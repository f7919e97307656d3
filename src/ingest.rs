//! Pipeline orchestration.
//!
//! One pass over a resource:
//!
//! ```text
//! fetch → validate → upsert → plan → publish dictionaries → recognize
//!       → expand → aggregate → sort → record pass
//! ```
//!
//! Recognition is incremental through the per-item dictionary markers;
//! expansion and aggregation through their watermarks. Running a pass
//! twice without new input changes nothing.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use concept_index_core::aggregate::{AggregationReport, Aggregator};
use concept_index_core::dictionary::Denylist;
use concept_index_core::error::StructureError;
use concept_index_core::expand::{ExpansionReport, Expander};
use concept_index_core::matcher::{DictionaryFile, DictionaryScope, Matcher};
use concept_index_core::models::{ContentItem, DictionaryVersionId, Structure};
use concept_index_core::recognize::{RecognitionReport, Recognizer};
use concept_index_core::store::{Store, UpsertReport};
use concept_index_core::tracker::VersionTracker;

use crate::config::Config;
use crate::db;
use crate::dictionary;
use crate::matcher::ProcessMatcher;
use crate::progress::{RunPhase, RunProgressEvent, RunProgressReporter};
use crate::sqlite_store::SqliteStore;
use crate::traits::{ConnectorRegistry, ContentConnector};

/// Outcome of one pass over one resource.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub resource: String,
    pub fetched: usize,
    pub rejected: usize,
    pub upsert: UpsertReport,
    pub version: DictionaryVersionId,
    pub opened_version: bool,
    pub recognition: RecognitionReport,
    pub expansion: ExpansionReport,
    pub aggregation: AggregationReport,
    pub ranked: usize,
}

impl RunSummary {
    pub fn print(&self) {
        println!("run {}", self.resource);
        println!("  fetched: {} items", self.fetched);
        if self.rejected > 0 {
            println!("  rejected: {} items", self.rejected);
        }
        println!(
            "  stored: {} new, {} changed, {} unchanged",
            self.upsert.inserted, self.upsert.changed, self.upsert.unchanged
        );
        println!(
            "  dictionary: v{}{}",
            self.version,
            if self.opened_version { " (new)" } else { "" }
        );
        println!("  recognized items: {}", self.recognition.items_done);
        if self.recognition.items_failed > 0 {
            println!(
                "  failed items: {} ({} failed batches)",
                self.recognition.items_failed, self.recognition.failed_batches
            );
        }
        println!(
            "  direct annotations: {} matcher, {} reported",
            self.recognition.matcher_annotations, self.recognition.reported_annotations
        );
        println!(
            "  expanded annotations: {} is-a, {} mapping",
            self.expansion.isa, self.expansion.mapping
        );
        println!(
            "  index: {} items, {} entries, {} concepts",
            self.aggregation.items, self.aggregation.entries, self.aggregation.concepts
        );
        println!("  ranked items: {}", self.ranked);
        println!("ok");
    }
}

/// Drop items that do not fit the structure or repeat an earlier id.
pub fn validate_items(structure: &Structure, items: Vec<ContentItem>) -> (Vec<ContentItem>, usize) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        let check = structure.validate(&item).and_then(|_| {
            if seen.contains(&item.id) {
                Err(StructureError::DuplicateItem(item.id.clone()))
            } else {
                Ok(())
            }
        });
        match check {
            Ok(()) => {
                seen.insert(item.id.clone());
                accepted.push(item);
            }
            Err(e) => {
                rejected += 1;
                warn!(resource = %structure.resource_id, error = %e, "rejecting item");
            }
        }
    }
    (accepted, rejected)
}

/// Run one full pass over the resource fed by `connector`.
pub async fn run_resource(
    config: &Config,
    store: &dyn Store,
    matcher: &dyn Matcher,
    connector: &dyn ContentConnector,
    reinit: bool,
    progress: &dyn RunProgressReporter,
) -> Result<RunSummary> {
    let structure = connector.describe_structure();
    let resource = structure.resource_id.as_str();
    let phase = |phase: RunPhase| {
        progress.report(RunProgressEvent::Phase {
            resource: resource.to_string(),
            phase,
        })
    };

    phase(RunPhase::Fetching);
    let fetched = connector
        .fetch_new_or_changed_items()
        .await
        .with_context(|| format!("Failed to fetch items of '{}'", resource))?;
    let fetched_count = fetched.len();
    let (items, rejected) = validate_items(structure, fetched);
    let upsert = store.upsert_items(resource, &items).await?;

    let tracker = VersionTracker::new(store);
    let (version, opened_version) = tracker.ensure_current().await?;
    let plan = tracker.plan(resource, version.id).await?;
    info!(
        resource,
        version = version.id,
        unseen = plan.unseen.len(),
        stale = plan.stale.len(),
        "planned recognition"
    );

    phase(RunPhase::Recognizing);
    let options = config.recognition_options();
    let recognizer = Recognizer::new(store, matcher, &options);
    let denylist = Denylist::new(&config.dictionary.denylist);
    let total = plan.len() as u64;
    let mut recognition = RecognitionReport::default();
    let mut full: Option<DictionaryFile> = None;

    if !plan.unseen.is_empty() {
        let file = dictionary::publish(
            store,
            &config.dictionary.dir,
            &denylist,
            version.id,
            DictionaryScope::Full,
        )
        .await?;
        recognition.merge(&recognizer.annotate(structure, &plan.unseen, &file).await?);
        full = Some(file);
        progress.report(RunProgressEvent::Recognizing {
            resource: resource.to_string(),
            n: plan.unseen.len() as u64,
            total,
        });
    }

    if !plan.stale.is_empty() {
        let scope = match plan.oldest_stale {
            Some(since) if !config.dictionary.with_complete_dictionary => {
                DictionaryScope::Delta { since }
            }
            _ => DictionaryScope::Full,
        };
        let file = match (&full, scope) {
            (Some(f), DictionaryScope::Full) => f.clone(),
            _ => {
                dictionary::publish(store, &config.dictionary.dir, &denylist, version.id, scope)
                    .await?
            }
        };
        recognition.merge(&recognizer.annotate(structure, &plan.stale, &file).await?);
        progress.report(RunProgressEvent::Recognizing {
            resource: resource.to_string(),
            n: total,
            total,
        });
    }

    phase(RunPhase::Expanding);
    let expansion_options = config.expansion_options();
    let expander = Expander::new(store, &expansion_options);
    let mut expansion = expander.expand(structure).await?;
    if !plan.stale.is_empty() {
        // Relations and mappings of newly loaded ontologies also reach
        // annotations stored by earlier passes.
        let stale: Vec<String> = plan.stale.iter().map(|i| i.id.clone()).collect();
        let refreshed = expander.expand_items(structure, &stale).await?;
        expansion.isa += refreshed.isa;
        expansion.mapping += refreshed.mapping;
        expansion.distance += refreshed.distance;
    }

    phase(RunPhase::Aggregating);
    let aggregator = Aggregator::new(store, &config.weights);
    let aggregation = if reinit {
        aggregator.reinit(structure).await?
    } else {
        aggregator.aggregate(structure).await?
    };

    phase(RunPhase::Sorting);
    let ranked = aggregator.sort(resource).await?;

    if recognition.items_failed == 0 {
        tracker.record_pass(resource, version.id).await?;
    } else {
        warn!(
            resource,
            failed = recognition.items_failed,
            "pass incomplete; failed items are retried on the next run"
        );
    }

    info!(
        resource,
        version = version.id,
        recognized = recognition.items_done,
        expanded = expansion.total(),
        indexed = aggregation.entries,
        "run finished"
    );

    Ok(RunSummary {
        resource: resource.to_string(),
        fetched: fetched_count,
        rejected,
        upsert,
        version: version.id,
        opened_version,
        recognition,
        expansion,
        aggregation,
        ranked,
    })
}

/// Run every registered resource in id order. A failing resource is
/// logged and the others still run; the call fails afterwards.
pub async fn run_all(
    config: &Config,
    store: &dyn Store,
    matcher: &dyn Matcher,
    registry: &ConnectorRegistry,
    reinit: bool,
    progress: &dyn RunProgressReporter,
) -> Result<Vec<RunSummary>> {
    let mut summaries = Vec::new();
    let mut failed = Vec::new();
    for connector in registry.connectors() {
        match run_resource(config, store, matcher, connector, reinit, progress).await {
            Ok(summary) => {
                summary.print();
                summaries.push(summary);
            }
            Err(e) => {
                error!(resource = connector.resource_id(), error = %format!("{:#}", e), "run failed");
                eprintln!("run {} failed: {:#}", connector.resource_id(), e);
                failed.push(connector.resource_id().to_string());
            }
        }
    }
    if !failed.is_empty() {
        bail!(
            "{} of {} resources failed: {}",
            failed.len(),
            registry.len(),
            failed.join(", ")
        );
    }
    Ok(summaries)
}

/// `cidx run <resource|all>`.
pub async fn run_command(
    config: &Config,
    target: &str,
    reinit: bool,
    progress: &dyn RunProgressReporter,
) -> Result<()> {
    let registry = ConnectorRegistry::from_config(config)?;
    if target != "all" && registry.find(target).is_none() {
        bail!(
            "Unknown resource: '{}'. Configured: {}",
            target,
            available(&registry)
        );
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let matcher = ProcessMatcher::from_config(config);

    let result = match registry.find(target) {
        Some(connector) if target != "all" => {
            run_resource(config, &store, &matcher, connector, reinit, progress)
                .await
                .map(|summary| summary.print())
        }
        _ => run_all(config, &store, &matcher, &registry, reinit, progress)
            .await
            .map(|_| ()),
    };

    pool.close().await;
    result
}

/// `cidx sort <resource>`.
pub async fn sort_command(config: &Config, resource: &str) -> Result<()> {
    let registry = ConnectorRegistry::from_config(config)?;
    if registry.find(resource).is_none() {
        bail!(
            "Unknown resource: '{}'. Configured: {}",
            resource,
            available(&registry)
        );
    }
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let ranked = Aggregator::new(&store, &config.weights).sort(resource).await?;
    println!("sort {}", resource);
    println!("  ranked items: {}", ranked);
    println!("ok");
    pool.close().await;
    Ok(())
}

fn available(registry: &ConnectorRegistry) -> String {
    let ids = registry.resource_ids();
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concept_index_core::error::MatcherError;
    use concept_index_core::matcher::{MatchHit, MatchRequest};
    use concept_index_core::models::{Concept, FieldPolicy, FieldSpec, Ontology, Relation, Term};
    use concept_index_core::store::memory::InMemoryStore;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::config::{
        DbConfig, DictionaryConfig, ExpansionConfig, MatcherConfig, RecognitionConfig,
    };
    use crate::progress::NoProgress;

    /// Reports a hit for every dictionary term whose text occurs in the
    /// line, and remembers which dictionaries it was handed.
    struct ContainsMatcher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Matcher for ContainsMatcher {
        async fn match_batch(
            &self,
            dictionary: &Path,
            batch: &[MatchRequest],
        ) -> std::result::Result<Vec<MatchHit>, MatcherError> {
            self.seen.lock().unwrap().push(
                dictionary
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
            let dict = std::fs::read_to_string(dictionary)?;
            let mut hits = Vec::new();
            for req in batch {
                for line in dict.lines() {
                    let (id, text) = line.split_once('\t').unwrap();
                    if req.text.to_lowercase().contains(text) {
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
            "fixed"
        }
        fn describe_structure(&self) -> &Structure {
            &self.structure
        }
        async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>> {
            Ok(self.items.lock().unwrap().clone())
        }
    }

    fn config(dir: &Path) -> Config {
        Config {
            db: DbConfig {
                path: dir.join("db.sqlite"),
            },
            dictionary: DictionaryConfig {
                dir: dir.join("dict"),
                with_complete_dictionary: false,
                denylist: vec![],
            },
            matcher: MatcherConfig {
                command: "unused".into(),
                args: vec![],
                timeout_secs: 5,
                batch_size: 2,
                work_dir: None,
            },
            recognition: RecognitionConfig::default(),
            expansion: ExpansionConfig::default(),
            weights: Default::default(),
            resources: Default::default(),
        }
    }

    fn connector(items: Vec<ContentItem>) -> FixedConnector {
        FixedConnector {
            structure: Structure {
                resource_id: "GEO".into(),
                fields: vec![FieldSpec {
                    name: "title".into(),
                    weight: 1.0,
                    policy: FieldPolicy::Recognize,
                }],
                large: false,
            },
            items: Mutex::new(items),
        }
    }

    async fn load(store: &InMemoryStore, ontology: i64, concepts: &[(i64, &str)]) {
        store
            .insert_ontologies(&[Ontology {
                id: ontology,
                virtual_id: ontology * 100,
                name: format!("o{}", ontology),
                version: "1".into(),
                dictionary_version: None,
            }])
            .await
            .unwrap();
        for (id, text) in concepts {
            store
                .insert_concepts(&[Concept {
                    id: *id,
                    ontology_id: ontology,
                    local_id: text.to_string(),
                }])
                .await
                .unwrap();
            store
                .insert_terms(&[Term {
                    id: *id,
                    concept_id: *id,
                    text: text.to_string(),
                    preferred: true,
                }])
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_validate_items_rejects_duplicates_and_undeclared() {
        let c = connector(vec![]);
        let (ok, rejected) = validate_items(
            &c.structure,
            vec![
                ContentItem::new("a").with_field("title", "x"),
                ContentItem::new("a").with_field("title", "y"),
                ContentItem::new("b").with_field("authors", "z"),
                ContentItem::new("c"),
            ],
        );
        assert_eq!(rejected, 2);
        let ids: Vec<&str> = ok.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_pass_then_delta_for_new_ontology() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let store = InMemoryStore::new();
        load(&store, 1, &[(10, "heart"), (11, "organ")]).await;
        store
            .insert_relations(&[Relation {
                concept_id: 10,
                ancestor_id: 11,
                level: 1,
            }])
            .await
            .unwrap();

        let matcher = ContainsMatcher {
            seen: Mutex::new(Vec::new()),
        };
        let source = connector(vec![
            ContentItem::new("GSE1").with_field("title", "Heart and lung"),
            ContentItem::new("GSE2").with_field("title", "Kidney"),
        ]);

        let first = run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.recognition.items_done, 2);
        assert_eq!(first.expansion.isa, 1);
        assert_eq!(first.aggregation.entries, 2);
        assert!(tmp.path().join("dict/dictionary_v1.tsv").exists());

        // Nothing new: no recognition, no new index rows.
        let again = run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(again.recognition.items_done, 0);
        assert_eq!(again.aggregation.items, 0);

        // A new ontology opens v2; both items only see the delta.
        load(&store, 2, &[(20, "kidney")]).await;
        let third = run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(third.version, 2);
        assert!(third.opened_version);
        assert_eq!(third.recognition.matcher_annotations, 1);
        assert_eq!(
            matcher.seen.lock().unwrap().last().unwrap(),
            "dictionary_v2_since_v1.tsv"
        );

        let entries = store.aggregates("GEO", "GSE2").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].concept_id, 20);
        assert_eq!(entries[0].rank, Some(0));
        assert_eq!(store.resource_ontologies("GEO").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_complete_dictionary_for_stale_items() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.dictionary.with_complete_dictionary = true;
        let store = InMemoryStore::new();
        load(&store, 1, &[(10, "heart")]).await;
        let matcher = ContainsMatcher {
            seen: Mutex::new(Vec::new()),
        };
        let source = connector(vec![ContentItem::new("GSE1").with_field("title", "heart")]);

        run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        load(&store, 2, &[(20, "kidney")]).await;
        run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(
            matcher.seen.lock().unwrap().last().unwrap(),
            "dictionary_v2.tsv"
        );
    }

    #[tokio::test]
    async fn test_changed_item_is_reannotated() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let store = InMemoryStore::new();
        load(&store, 1, &[(10, "heart"), (12, "lung")]).await;
        let matcher = ContainsMatcher {
            seen: Mutex::new(Vec::new()),
        };
        let source = connector(vec![ContentItem::new("GSE1").with_field("title", "heart")]);
        run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();

        *source.items.lock().unwrap() = vec![ContentItem::new("GSE1").with_field("title", "lung")];
        let summary = run_resource(&cfg, &store, &matcher, &source, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.upsert.changed, 1);
        assert_eq!(summary.recognition.items_done, 1);

        let entries = store.aggregates("GEO", "GSE1").await.unwrap();
        let concepts: Vec<i64> = entries.iter().map(|e| e.concept_id).collect();
        assert_eq!(concepts, vec![12]);
    }

    #[tokio::test]
    async fn test_run_all_continues_past_failure() {
        struct Broken(Structure);

        #[async_trait]
        impl ContentConnector for Broken {
            fn resource_id(&self) -> &str {
                &self.0.resource_id
            }
            fn description(&self) -> &str {
                "broken"
            }
            fn describe_structure(&self) -> &Structure {
                &self.0
            }
            async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>> {
                bail!("source offline")
            }
        }

        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let store = InMemoryStore::new();
        load(&store, 1, &[(10, "heart")]).await;
        let matcher = ContainsMatcher {
            seen: Mutex::new(Vec::new()),
        };

        let mut broken_structure = connector(vec![]).structure;
        broken_structure.resource_id = "AAA".into();
        let mut registry = ConnectorRegistry::new();
        registry.register(Box::new(Broken(broken_structure)));
        registry.register(Box::new(connector(vec![
            ContentItem::new("GSE1").with_field("title", "heart"),
        ])));

        let err = run_all(&cfg, &store, &matcher, &registry, false, &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("AAA"));
        // GEO ran after AAA failed.
        assert_eq!(store.aggregates("GEO", "GSE1").await.unwrap().len(), 1);
    }
}
