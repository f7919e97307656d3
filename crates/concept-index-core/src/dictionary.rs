//! Dictionary entry selection.
//!
//! Flattens the term store into `(termId, termText)` entries for the
//! matcher. Writing the file is left to the caller; this module only
//! decides which terms go in and how each line reads.

use std::collections::HashSet;

use anyhow::Result;

use crate::matcher::{flatten_whitespace, DictionaryScope};
use crate::models::{Term, TermId};
use crate::store::Store;

/// One dictionary line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DictionaryEntry {
    pub term_id: TermId,
    pub text: String,
}

impl DictionaryEntry {
    pub fn to_line(&self) -> String {
        format!("{}\t{}", self.term_id, self.text)
    }
}

/// Term texts never handed to the matcher, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    terms: HashSet<String>,
}

impl Denylist {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, text: &str) -> bool {
        self.terms.contains(&text.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

fn entry_for(term: &Term, denylist: &Denylist) -> Option<DictionaryEntry> {
    let text = flatten_whitespace(&term.text);
    if text.is_empty() || denylist.contains(&text) {
        return None;
    }
    Some(DictionaryEntry {
        term_id: term.id,
        text,
    })
}

/// Select the dictionary entries for a scope, ascending by term id.
pub async fn dictionary_entries(
    store: &dyn Store,
    scope: DictionaryScope,
    denylist: &Denylist,
) -> Result<Vec<DictionaryEntry>> {
    let newer_than = match scope {
        DictionaryScope::Full => None,
        DictionaryScope::Delta { since } => Some(since),
    };
    let terms = store.dictionary_terms(newer_than).await?;
    let mut entries: Vec<DictionaryEntry> = terms
        .iter()
        .filter_map(|t| entry_for(t, denylist))
        .collect();
    entries.sort_by_key(|e| e.term_id);
    Ok(entries)
}

/// Render entries as file contents, one newline-terminated line each.
pub fn render(entries: &[DictionaryEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&e.to_line());
        out.push('\n');
    }
    out
}
