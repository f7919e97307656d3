//! Contract of the external string matcher.
//!
//! The matcher is a black box: given a dictionary file of
//! `termId<TAB>termText` lines and a batch of `itemId<TAB>fieldId<TAB>text`
//! lines, it reports which terms occur in which (item, field). The
//! application crate drives a real external process; tests script hits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::MatcherError;
use crate::models::{DictionaryVersionId, TermId};

/// One input line of a matcher batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    pub item_id: String,
    pub field: String,
    pub text: String,
}

impl MatchRequest {
    /// Render as a batch-file line. Tabs and line breaks inside the text are
    /// collapsed to spaces so the line stays a single record.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.item_id,
            self.field,
            flatten_whitespace(&self.text)
        )
    }
}

/// One term occurrence reported by the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchHit {
    pub item_id: String,
    pub field: String,
    pub term_id: TermId,
}

impl MatchHit {
    /// Parse an output line `itemId<TAB>fieldId<TAB>termId[<TAB>extra...]`.
    ///
    /// Returns `None` for blank or malformed lines.
    pub fn parse_line(line: &str) -> Option<MatchHit> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        let mut cols = line.split('\t');
        let item_id = cols.next()?.trim();
        let field = cols.next()?.trim();
        let term_id = cols.next()?.trim().parse::<TermId>().ok()?;
        if item_id.is_empty() || field.is_empty() {
            return None;
        }
        Some(MatchHit {
            item_id: item_id.to_string(),
            field: field.to_string(),
            term_id,
        })
    }
}

/// Which dictionary a matcher run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryScope {
    /// Every active term as of the version.
    Full,
    /// Only terms of ontology versions that entered after `since`.
    Delta { since: DictionaryVersionId },
}

/// A published dictionary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryFile {
    pub version: DictionaryVersionId,
    pub scope: DictionaryScope,
    pub path: PathBuf,
    pub entries: usize,
    /// SHA-256 of the file contents.
    pub digest: String,
}

/// The concept-recognition engine.
///
/// One call is one at-most-once invocation for one batch. An `Err` means
/// the whole batch produced nothing.
#[async_trait]
pub trait Matcher: Send + Sync {
    async fn match_batch(
        &self,
        dictionary: &Path,
        batch: &[MatchRequest],
    ) -> Result<Vec<MatchHit>, MatcherError>;
}

/// Collapse every run of whitespace (tabs and line breaks included) into
/// one space and trim.
pub fn flatten_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_basic() {
        let hit = MatchHit::parse_line("GSE1\ttitle\t42").unwrap();
        assert_eq!(hit.item_id, "GSE1");
        assert_eq!(hit.field, "title");
        assert_eq!(hit.term_id, 42);
    }

    #[test]
    fn test_parse_line_ignores_extra_columns() {
        let hit = MatchHit::parse_line("GSE1\tsummary\t7\t10\t15\r\n").unwrap();
        assert_eq!(hit.term_id, 7);
        assert_eq!(hit.field, "summary");
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert_eq!(MatchHit::parse_line(""), None);
        assert_eq!(MatchHit::parse_line("GSE1\ttitle"), None);
        assert_eq!(MatchHit::parse_line("GSE1\ttitle\tabc"), None);
        assert_eq!(MatchHit::parse_line("\ttitle\t3"), None);
    }

    #[test]
    fn test_request_line_is_single_record() {
        let req = MatchRequest {
            item_id: "GSE1".to_string(),
            field: "summary".to_string(),
            text: "heart\nattack\tin mice\r\n".to_string(),
        };
        assert_eq!(req.to_line(), "GSE1\tsummary\theart attack in mice");
    }

    #[test]
    fn test_flatten_whitespace_collapses_runs() {
        assert_eq!(flatten_whitespace("a \n b"), "a b");
        assert_eq!(flatten_whitespace("a\t\tb  c"), "a b c");
        assert_eq!(flatten_whitespace("\n\nabc\n"), "abc");
    }
}
