//! Concept recognition: text fields → direct annotations.
//!
//! For a set of pending items the recognizer
//!
//! 1. batches `(item, field, text)` lines of every RECOGNIZE field,
//! 2. runs the matcher once per batch against a published dictionary,
//! 3. maps term hits to concepts, drops stopwords, de-duplicates and
//!    stores them as direct annotations,
//! 4. adds REPORTED fields' concept ids as `reported` annotations,
//! 5. advances each item's version marker once both merges succeeded.
//!
//! A failed batch (matcher error or store error on insert) counts as zero
//! hits: its items keep their old marker and come back on the next run.
//! Rows committed by other batches are untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::matcher::{DictionaryFile, MatchRequest, Matcher};
use crate::models::{
    ConceptId, ContentItem, DictionaryVersionId, DirectAnnotation, DirectSource, FieldPolicy,
    ItemState, Structure, Term, TermId,
};
use crate::store::Store;
use crate::tracker::VersionTracker;

/// Recognition tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct RecognitionOptions {
    /// Maximum lines per matcher invocation.
    pub batch_size: usize,
    /// Lower-cased term texts whose hits are discarded.
    pub stopwords: HashSet<String>,
    /// Separator of concept ids inside REPORTED fields.
    pub reported_delimiter: String,
}

impl RecognitionOptions {
    pub fn new<I, S>(batch_size: usize, stopwords: I, reported_delimiter: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            batch_size: batch_size.max(1),
            stopwords: stopwords
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect(),
            reported_delimiter: reported_delimiter.to_string(),
        }
    }

    pub fn is_stopword(&self, text: &str) -> bool {
        self.stopwords.contains(&text.trim().to_lowercase())
    }
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self::new(500, Vec::<String>::new(), ";")
    }
}

/// Outcome of one recognition pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionReport {
    pub items_done: usize,
    pub items_failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub matcher_annotations: usize,
    pub reported_annotations: usize,
    pub stopword_hits: usize,
    pub skipped_hits: usize,
}

impl RecognitionReport {
    /// Direct annotation rows written.
    pub fn annotations(&self) -> usize {
        self.matcher_annotations + self.reported_annotations
    }

    pub fn merge(&mut self, other: &RecognitionReport) {
        self.items_done += other.items_done;
        self.items_failed += other.items_failed;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.matcher_annotations += other.matcher_annotations;
        self.reported_annotations += other.reported_annotations;
        self.stopword_hits += other.stopword_hits;
        self.skipped_hits += other.skipped_hits;
    }
}

#[derive(Default)]
struct BatchOutcome {
    inserted: usize,
    stopwords: usize,
    skipped: usize,
}

type AnnotationKey = (String, String, ConceptId);

/// Keep the strongest source per (item, field, concept).
fn keep_strongest(best: &mut BTreeMap<AnnotationKey, DirectSource>, key: AnnotationKey, source: DirectSource) {
    match best.get(&key) {
        Some(existing) if existing.strength() >= source.strength() => {}
        _ => {
            best.insert(key, source);
        }
    }
}

fn into_rows(
    best: BTreeMap<AnnotationKey, DirectSource>,
    version: DictionaryVersionId,
) -> Vec<DirectAnnotation> {
    best.into_iter()
        .map(|((item_id, field, concept_id), source)| DirectAnnotation {
            item_id,
            field,
            concept_id,
            source,
            dictionary_version: version,
        })
        .collect()
}

pub struct Recognizer<'a> {
    store: &'a dyn Store,
    matcher: &'a dyn Matcher,
    options: &'a RecognitionOptions,
}

impl<'a> Recognizer<'a> {
    pub fn new(
        store: &'a dyn Store,
        matcher: &'a dyn Matcher,
        options: &'a RecognitionOptions,
    ) -> Self {
        Self {
            store,
            matcher,
            options,
        }
    }

    /// Annotate `items` of the resource described by `structure` with the
    /// given dictionary, advancing finished items to `dictionary.version`.
    pub async fn annotate(
        &self,
        structure: &Structure,
        items: &[ContentItem],
        dictionary: &DictionaryFile,
    ) -> Result<RecognitionReport> {
        let resource = structure.resource_id.as_str();
        let version = dictionary.version;
        let mut report = RecognitionReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let mut states: HashMap<&str, ItemState> = items
            .iter()
            .map(|i| (i.id.as_str(), ItemState::Queued))
            .collect();

        let requests = recognition_requests(structure, items);
        let mut failed: HashSet<String> = HashSet::new();
        for batch in requests.chunks(self.options.batch_size) {
            report.batches += 1;
            match self.match_batch(resource, batch, dictionary).await {
                Ok(outcome) => {
                    report.matcher_annotations += outcome.inserted;
                    report.stopword_hits += outcome.stopwords;
                    report.skipped_hits += outcome.skipped;
                }
                Err(e) => {
                    report.failed_batches += 1;
                    warn!(
                        resource,
                        lines = batch.len(),
                        error = %e,
                        "matcher batch failed; its items stay at their previous version"
                    );
                    failed.extend(batch.iter().map(|r| r.item_id.clone()));
                }
            }
        }

        for (id, state) in states.iter_mut() {
            if !failed.contains(*id) {
                *state = ItemState::Matched;
            }
        }

        for item in items {
            if states.get(item.id.as_str()) != Some(&ItemState::Matched) {
                continue;
            }
            match self.merge_reported(structure, item, version).await {
                Ok(n) => {
                    report.reported_annotations += n;
                    states.insert(item.id.as_str(), ItemState::ReportedMerged);
                }
                Err(e) => {
                    warn!(resource, item = %item.id, error = %e, "reported annotations not merged");
                }
            }
        }

        let done: Vec<String> = items
            .iter()
            .filter(|i| states.get(i.id.as_str()) == Some(&ItemState::ReportedMerged))
            .map(|i| i.id.clone())
            .collect();
        VersionTracker::new(self.store)
            .mark_done(resource, &done, version)
            .await?;

        report.items_done = done.len();
        report.items_failed = items.len() - done.len();
        info!(
            resource,
            version,
            items = items.len(),
            done = report.items_done,
            failed = report.items_failed,
            matcher = report.matcher_annotations,
            reported = report.reported_annotations,
            "recognition finished"
        );
        Ok(report)
    }

    async fn match_batch(
        &self,
        resource: &str,
        batch: &[MatchRequest],
        dictionary: &DictionaryFile,
    ) -> Result<BatchOutcome> {
        let hits = self.matcher.match_batch(&dictionary.path, batch).await?;
        let mut outcome = BatchOutcome::default();

        let expected: HashSet<(&str, &str)> = batch
            .iter()
            .map(|r| (r.item_id.as_str(), r.field.as_str()))
            .collect();

        let mut term_ids: Vec<TermId> = hits.iter().map(|h| h.term_id).collect();
        term_ids.sort_unstable();
        term_ids.dedup();
        let terms: HashMap<TermId, Term> = self
            .store
            .terms(&term_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let mut best: BTreeMap<AnnotationKey, DirectSource> = BTreeMap::new();
        for hit in &hits {
            if !expected.contains(&(hit.item_id.as_str(), hit.field.as_str())) {
                warn!(
                    resource,
                    item = %hit.item_id,
                    field = %hit.field,
                    "matcher reported a hit outside its batch; skipping"
                );
                outcome.skipped += 1;
                continue;
            }
            let Some(term) = terms.get(&hit.term_id) else {
                warn!(resource, term_id = hit.term_id, "matcher reported an unknown term; skipping");
                outcome.skipped += 1;
                continue;
            };
            if self.options.is_stopword(&term.text) {
                outcome.stopwords += 1;
                continue;
            }
            keep_strongest(
                &mut best,
                (hit.item_id.clone(), hit.field.clone(), term.concept_id),
                DirectSource::Matcher {
                    term_id: term.id,
                    preferred: term.preferred,
                },
            );
        }

        let rows = into_rows(best, dictionary.version);
        if !rows.is_empty() {
            outcome.inserted = self.store.insert_direct(resource, &rows).await?;
        }
        debug!(
            resource,
            lines = batch.len(),
            hits = hits.len(),
            inserted = outcome.inserted,
            "matcher batch stored"
        );
        Ok(outcome)
    }

    async fn merge_reported(
        &self,
        structure: &Structure,
        item: &ContentItem,
        version: DictionaryVersionId,
    ) -> Result<usize> {
        let resource = structure.resource_id.as_str();
        let mut best: BTreeMap<AnnotationKey, DirectSource> = BTreeMap::new();

        for spec in &structure.fields {
            let FieldPolicy::Reported { ontology } = spec.policy else {
                continue;
            };
            let Some(text) = item.field(&spec.name) else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            let Some(active) = self.store.latest_ontology(ontology).await? else {
                warn!(
                    resource,
                    field = %spec.name,
                    ontology,
                    "no ontology loaded for reported field; skipping"
                );
                continue;
            };
            for local_id in text
                .split(self.options.reported_delimiter.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                match self.store.find_concept(active.id, local_id).await? {
                    Some(concept) => keep_strongest(
                        &mut best,
                        (item.id.clone(), spec.name.clone(), concept.id),
                        DirectSource::Reported,
                    ),
                    None => debug!(
                        resource,
                        item = %item.id,
                        concept = local_id,
                        ontology = active.id,
                        "reported concept not in active ontology version"
                    ),
                }
            }
        }

        let rows = into_rows(best, version);
        if rows.is_empty() {
            return Ok(0);
        }
        self.store.insert_direct(resource, &rows).await
    }
}

/// Matcher input lines for every non-blank RECOGNIZE field, in item order
/// then structure order.
pub fn recognition_requests(structure: &Structure, items: &[ContentItem]) -> Vec<MatchRequest> {
    let mut requests = Vec::new();
    for item in items {
        for spec in &structure.fields {
            if spec.policy != FieldPolicy::Recognize {
                continue;
            }
            match item.field(&spec.name) {
                Some(text) if !text.trim().is_empty() => requests.push(MatchRequest {
                    item_id: item.id.clone(),
                    field: spec.name.clone(),
                    text: text.to_string(),
                }),
                _ => {}
            }
        }
    }
    requests
}
