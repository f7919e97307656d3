//! # Concept Index Core
//!
//! I/O-free logic for Concept Index: data models, the store abstraction,
//! the matcher contract, and the annotation → expansion → aggregation
//! pipeline stages.
//!
//! This crate contains no tokio, sqlx, filesystem or process handling.
//! Those live in the `concept-index` application crate, which supplies a
//! SQLite [`store::Store`] and an external-process [`matcher::Matcher`].
//!
//! ## Stages
//!
//! ```text
//! dictionary ──▶ recognize ──▶ expand ──▶ aggregate ──▶ sort
//!  (terms)      (direct)      (is-a,     (score per     (rank per
//!                              mapping)   item/concept)  item)
//! ```

pub mod aggregate;
pub mod dictionary;
pub mod error;
pub mod expand;
pub mod matcher;
pub mod models;
pub mod recognize;
pub mod scoring;
pub mod store;
pub mod tracker;
