//! Index lookup.
//!
//! `cidx search <concept-id>` lists the items annotated with a concept,
//! best score first, ties broken by item id.

use anyhow::{bail, Result};

use concept_index_core::models::ConceptId;
use concept_index_core::store::{ConceptHit, Store};

pub const DEFAULT_LIMIT: usize = 20;

pub async fn search_concept(
    store: &dyn Store,
    concept: ConceptId,
    resource: Option<&str>,
    limit: usize,
) -> Result<Vec<ConceptHit>> {
    if limit == 0 {
        bail!("--limit must be > 0");
    }
    store.entries_for_concept(concept, resource, limit).await
}

pub async fn run_search(
    store: &dyn Store,
    concept: ConceptId,
    resource: Option<&str>,
    limit: usize,
) -> Result<()> {
    let Some(c) = store.concept(concept).await? else {
        bail!("Unknown concept: {}", concept);
    };
    let hits = search_concept(store, concept, resource, limit).await?;
    if hits.is_empty() {
        println!("No entries for concept {} ({}).", concept, c.local_id);
        return Ok(());
    }

    println!("concept {} ({})", concept, c.local_id);
    println!("{:<12} {:<24} {:>10} {:>6}", "RESOURCE", "ITEM", "SCORE", "RANK");
    for hit in &hits {
        let rank = hit
            .entry
            .rank
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<24} {:>10.2} {:>6}",
            hit.resource, hit.entry.item_id, hit.entry.score, rank
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concept_index_core::models::AggregatedEntry;
    use concept_index_core::store::memory::InMemoryStore;

    fn entry(item: &str, score: f64) -> AggregatedEntry {
        AggregatedEntry {
            item_id: item.to_string(),
            concept_id: 7,
            score,
            rank: Some(0),
        }
    }

    #[tokio::test]
    async fn test_hits_by_score_then_item() {
        let store = InMemoryStore::new();
        store
            .replace_aggregates("GEO", "b", &[entry("b", 5.0)])
            .await
            .unwrap();
        store
            .replace_aggregates("GEO", "a", &[entry("a", 5.0)])
            .await
            .unwrap();
        store
            .replace_aggregates("AE", "z", &[entry("z", 9.0)])
            .await
            .unwrap();

        let hits = search_concept(&store, 7, None, 10).await.unwrap();
        let items: Vec<&str> = hits.iter().map(|h| h.entry.item_id.as_str()).collect();
        assert_eq!(items, vec!["z", "a", "b"]);

        let geo = search_concept(&store, 7, Some("GEO"), 1).await.unwrap();
        assert_eq!(geo.len(), 1);
        assert_eq!(geo[0].entry.item_id, "a");

        assert!(search_concept(&store, 7, None, 0).await.is_err());
    }
}
