//! Dictionary versions and per-item processing state.
//!
//! Every item carries the dictionary version it was last processed
//! against. A run works on the items below the current version: items never
//! seen are matched with the full dictionary, items processed earlier only
//! need the terms added since.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::models::{ContentItem, DictionaryVersion, DictionaryVersionId, Ontology};
use crate::store::Store;

/// Items of one resource that need recognition against `version`.
#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    pub version: DictionaryVersionId,
    /// Never processed (marker 0).
    pub unseen: Vec<ContentItem>,
    /// Processed against an older dictionary.
    pub stale: Vec<ContentItem>,
    /// Oldest marker among `stale`, the base of their delta dictionary.
    pub oldest_stale: Option<DictionaryVersionId>,
}

impl WorkPlan {
    pub fn len(&self) -> usize {
        self.unseen.len() + self.stale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unseen.is_empty() && self.stale.is_empty()
    }
}

pub struct VersionTracker<'a> {
    store: &'a dyn Store,
}

impl<'a> VersionTracker<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub async fn current(&self) -> Result<Option<DictionaryVersion>> {
        self.store.latest_dictionary_version().await
    }

    /// Ontology versions loaded but not yet part of any dictionary.
    pub async fn pending_ontologies(&self) -> Result<Vec<Ontology>> {
        Ok(self
            .store
            .ontologies()
            .await?
            .into_iter()
            .filter(|o| o.dictionary_version.is_none())
            .collect())
    }

    /// Open a new dictionary version.
    pub async fn open_version(&self, name: Option<&str>) -> Result<DictionaryVersion> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("dictionary-{}", Utc::now().format("%Y%m%dT%H%M%SZ")),
        };
        let version = self.store.create_dictionary_version(&name).await?;
        info!(version = version.id, name = %version.name, "opened dictionary version");
        Ok(version)
    }

    /// The current version, opening a new one first when there is none or
    /// when ontology versions are waiting. The flag is `true` if a version
    /// was opened.
    pub async fn ensure_current(&self) -> Result<(DictionaryVersion, bool)> {
        let pending = self.pending_ontologies().await?;
        match self.current().await? {
            Some(v) if pending.is_empty() => Ok((v, false)),
            _ => Ok((self.open_version(None).await?, true)),
        }
    }

    /// Select the items of a resource below `version`.
    pub async fn plan(&self, resource: &str, version: DictionaryVersionId) -> Result<WorkPlan> {
        let mut plan = WorkPlan {
            version,
            ..Default::default()
        };
        for tracked in self.store.items_below_version(resource, version).await? {
            if tracked.processed_version == 0 {
                plan.unseen.push(tracked.item);
            } else {
                plan.oldest_stale = Some(match plan.oldest_stale {
                    Some(v) => v.min(tracked.processed_version),
                    None => tracked.processed_version,
                });
                plan.stale.push(tracked.item);
            }
        }
        Ok(plan)
    }

    /// Advance item markers to `version`.
    pub async fn mark_done(
        &self,
        resource: &str,
        item_ids: &[String],
        version: DictionaryVersionId,
    ) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        self.store
            .set_processed_version(resource, item_ids, version)
            .await
    }

    /// Record the ontology versions a finished pass covered.
    pub async fn record_pass(&self, resource: &str, version: DictionaryVersionId) -> Result<()> {
        self.store.record_resource_ontologies(resource, version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn ontology(id: i64) -> Ontology {
        Ontology {
            id,
            virtual_id: id * 10,
            name: "o".into(),
            version: "1".into(),
            dictionary_version: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_current_opens_for_pending_ontologies() {
        let store = InMemoryStore::new();
        let tracker = VersionTracker::new(&store);
        assert!(tracker.current().await.unwrap().is_none());

        let (v1, opened) = tracker.ensure_current().await.unwrap();
        assert!(opened);
        assert_eq!(v1.id, 1);

        let (same, opened) = tracker.ensure_current().await.unwrap();
        assert!(!opened);
        assert_eq!(same.id, 1);

        store.insert_ontologies(&[ontology(1)]).await.unwrap();
        assert_eq!(tracker.pending_ontologies().await.unwrap().len(), 1);
        let (v2, opened) = tracker.ensure_current().await.unwrap();
        assert!(opened);
        assert_eq!(v2.id, 2);
        assert!(tracker.pending_ontologies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_splits_unseen_and_stale() {
        let store = InMemoryStore::new();
        let tracker = VersionTracker::new(&store);
        let items = vec![
            ContentItem::new("a").with_field("title", "x"),
            ContentItem::new("b").with_field("title", "y"),
            ContentItem::new("c").with_field("title", "z"),
        ];
        store.upsert_items("R", &items).await.unwrap();
        tracker.mark_done("R", &["a".to_string()], 1).await.unwrap();
        tracker.mark_done("R", &["b".to_string()], 3).await.unwrap();

        let plan = tracker.plan("R", 3).await.unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.unseen[0].id, "c");
        assert_eq!(plan.stale[0].id, "a");
        assert_eq!(plan.oldest_stale, Some(1));

        let plan = tracker.plan("R", 1).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.stale.is_empty());
    }
}
