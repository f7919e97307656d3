//! # Concept Index
//!
//! Ontology-driven concept annotation and ranked indexing for
//! heterogeneous text resources.
//!
//! Content items are fetched from resources through connectors, matched
//! against a dictionary of ontology terms by an external matcher, expanded
//! along is-a and mapping relations, and aggregated into a weighted,
//! ranked index from concept to item.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ Connectors  │──▶│  Recognize → Expand → Score  │──▶│  SQLite  │
//! │   (jsonl)   │   │   (external matcher process) │   │  index   │
//! └─────────────┘   └──────────────────────────────┘   └────┬─────┘
//!        ▲                         ▲                        │
//!        │                  ┌──────┴──────┐                 ▼
//!        │                  │ Dictionary  │            ┌──────────┐
//!        │                  │  versions   │            │   CLI    │
//!        │                  └─────────────┘            │  (cidx)  │
//!        └─────────────────────────────────────────────┴──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cidx init                         # create database
//! cidx ontology load ./bundles/go   # load an ontology version
//! cidx run all                      # annotate and index every resource
//! cidx search 1234 --resource GEO   # items indexed with concept 1234
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | Connector trait and registry |
//! | [`connector_fs`] | JSON-lines file connector |
//! | [`matcher`] | External matcher process |
//! | [`dictionary`] | Dictionary file publishing |
//! | [`loader`] | Ontology bundle loading and retirement |
//! | [`ingest`] | Pipeline orchestration |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`progress`] | Run progress on stderr |
//! | [`stats`] | Index statistics |
//! | [`search`] | Concept lookup |
//! | [`resources`] | Resource listing |

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod dictionary;
pub mod ingest;
pub mod loader;
pub mod matcher;
pub mod migrate;
pub mod progress;
pub mod resources;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
