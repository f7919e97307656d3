//! Typed errors for the cases callers branch on.
//!
//! Everything else is reported through `anyhow`.

use thiserror::Error;

/// A content item that does not conform to its resource's [`Structure`](crate::models::Structure).
///
/// Malformed items are rejected before recognition; the pipeline logs
/// them and carries on with the rest of the fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructureError {
    #[error("item id is empty")]
    EmptyId,

    #[error("item id '{0}' contains a tab or newline")]
    InvalidId(String),

    #[error("item '{item}' has field '{field}' not declared by resource '{resource}'")]
    UndeclaredField {
        resource: String,
        item: String,
        field: String,
    },

    #[error("item '{item}' repeats field '{field}'")]
    DuplicateField { item: String, field: String },

    #[error("item id '{0}' appears more than once in the fetch")]
    DuplicateItem(String),
}

/// Failure of one matcher invocation.
///
/// Any of these makes the batch count as zero hits; the items in it keep
/// their old version marker and are retried on the next run.
#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("failed to start matcher '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("matcher timed out after {0} seconds")]
    Timeout(u64),

    #[error("matcher exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("matcher I/O error: {0}")]
    Io(#[from] std::io::Error),
}
