//! Dictionary publishing.
//!
//! Turns the selected dictionary entries into a file the matcher reads.
//! Files are named after the version they belong to:
//!
//! | Scope | File |
//! |-------|------|
//! | full | `dictionary_v{n}.tsv` |
//! | delta | `dictionary_v{n}_since_v{m}.tsv` |
//!
//! A file is written to a temporary name and renamed into place, so a
//! matcher never sees a half-written dictionary.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use concept_index_core::dictionary::{dictionary_entries, render, Denylist};
use concept_index_core::matcher::{DictionaryFile, DictionaryScope};
use concept_index_core::models::DictionaryVersionId;
use concept_index_core::store::Store;
use concept_index_core::tracker::VersionTracker;

use crate::config::Config;

pub fn file_name(version: DictionaryVersionId, scope: DictionaryScope) -> String {
    match scope {
        DictionaryScope::Full => format!("dictionary_v{}.tsv", version),
        DictionaryScope::Delta { since } => {
            format!("dictionary_v{}_since_v{}.tsv", version, since)
        }
    }
}

/// Write the dictionary of `version` for `scope` into `dir`.
pub async fn publish(
    store: &dyn Store,
    dir: &Path,
    denylist: &Denylist,
    version: DictionaryVersionId,
    scope: DictionaryScope,
) -> Result<DictionaryFile> {
    let entries = dictionary_entries(store, scope, denylist).await?;
    let content = render(&entries);
    let digest = format!("{:x}", Sha256::digest(content.as_bytes()));

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create dictionary dir {}", dir.display()))?;

    let path = dir.join(file_name(version, scope));
    let tmp = dir.join(format!(".{}.{}.tmp", file_name(version, scope), Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, content.as_bytes()).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to write {}", tmp.display()));
    }
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("Failed to publish {}", path.display()))?;

    info!(
        version,
        path = %path.display(),
        entries = entries.len(),
        digest = %digest,
        "published dictionary"
    );

    Ok(DictionaryFile {
        version,
        scope,
        path,
        entries: entries.len(),
        digest,
    })
}

/// `cidx dictionary build`.
///
/// Opens a new version when ontologies are waiting (or when `name` is
/// given), then writes its dictionary: the delta since the previous
/// version by default, the full dictionary with `full` or when there is no
/// previous version.
pub async fn build_dictionary(
    config: &Config,
    store: &dyn Store,
    full: bool,
    name: Option<&str>,
) -> Result<()> {
    let tracker = VersionTracker::new(store);
    let previous = tracker.current().await?;
    let (version, opened) = match name {
        Some(n) => (tracker.open_version(Some(n)).await?, true),
        None => tracker.ensure_current().await?,
    };

    let scope = match previous {
        Some(p) if opened && !full && p.id < version.id => DictionaryScope::Delta { since: p.id },
        _ => DictionaryScope::Full,
    };

    let denylist = Denylist::new(&config.dictionary.denylist);
    let file = publish(store, &config.dictionary.dir, &denylist, version.id, scope).await?;

    println!("dictionary v{} ({})", version.id, version.name);
    println!("  opened: {}", if opened { "yes" } else { "no" });
    println!("  file: {}", file.path.display());
    println!("  entries: {}", file.entries);
    println!("  sha256: {}", file.digest);
    println!("ok");
    Ok(())
}
