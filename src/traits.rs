//! Connector extension point.
//!
//! Every indexed resource is fed by one [`ContentConnector`]: a thin
//! adapter that knows how to fetch that resource's records and which
//! fields they carry. The pipeline never looks behind this trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │  Built-in    │   │    Custom       │  │
//! │  │  jsonl       │   │    (Rust)       │  │
//! │  └──────────────┘   └─────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!          run_resource() → recognize → expand → aggregate
//! ```
//!
//! # Usage
//!
//! ```rust
//! use concept_index::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::new();
//! // connectors.register(Box::new(MyConnector::new()));
//! assert!(connectors.is_empty());
//! ```

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use concept_index_core::models::{ContentItem, Structure};

use crate::config::Config;

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A resource-specific source of content items.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`] or
///    built from config by [`ConnectorRegistry::from_config`].
/// 2. [`describe_structure`](ContentConnector::describe_structure) tells
///    the pipeline which fields exist, their weights and their policies.
/// 3. [`fetch_new_or_changed_items`](ContentConnector::fetch_new_or_changed_items)
///    is called once per `cidx run`.
///
/// Returning unchanged items is allowed: the store compares content
/// hashes and ignores them.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use concept_index::traits::ContentConnector;
/// use concept_index_core::models::{ContentItem, Structure};
///
/// pub struct StaticConnector {
///     structure: Structure,
///     items: Vec<ContentItem>,
/// }
///
/// #[async_trait]
/// impl ContentConnector for StaticConnector {
///     fn resource_id(&self) -> &str { &self.structure.resource_id }
///     fn description(&self) -> &str { "Fixed items for demos" }
///     fn describe_structure(&self) -> &Structure { &self.structure }
///
///     async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>> {
///         Ok(self.items.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait ContentConnector: Send + Sync {
    /// Stable resource identifier (e.g. `"GEO"`).
    fn resource_id(&self) -> &str;

    /// One-line description, shown by `cidx resources`.
    fn description(&self) -> &str;

    /// Connector type identifier; built-ins return their config `type`.
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// Field layout of the items this connector produces.
    fn describe_structure(&self) -> &Structure;

    /// Fetch the resource's items. Each item should conform to
    /// [`describe_structure`](ContentConnector::describe_structure);
    /// nonconforming ones are rejected by the pipeline.
    async fn fetch_new_or_changed_items(&self) -> Result<Vec<ContentItem>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Resource id → connector, iterated in id order.
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Box<dyn ContentConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: BTreeMap::new(),
        }
    }

    /// Create a registry holding one connector per `[resources.<id>]` entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_fs::JsonLinesConnector;

        let mut registry = Self::new();
        for (id, cfg) in &config.resources {
            let connector: Box<dyn ContentConnector> = match cfg.kind.as_str() {
                "jsonl" => Box::new(JsonLinesConnector::new(id, cfg.clone())?),
                other => bail!("resource '{}': unknown connector type '{}'", id, other),
            };
            registry.register(connector);
        }
        Ok(registry)
    }

    /// Register a connector, replacing any with the same resource id.
    pub fn register(&mut self, connector: Box<dyn ContentConnector>) {
        self.connectors
            .insert(connector.resource_id().to_string(), connector);
    }

    /// All connectors, ascending by resource id.
    pub fn connectors(&self) -> impl Iterator<Item = &dyn ContentConnector> {
        self.connectors.values().map(|c| c.as_ref())
    }

    pub fn find(&self, resource_id: &str) -> Option<&dyn ContentConnector> {
        self.connectors.get(resource_id).map(|c| c.as_ref())
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    /// Structures of every registered resource.
    pub fn structures(&self) -> Vec<Structure> {
        self.connectors()
            .map(|c| c.describe_structure().clone())
            .collect()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Return the count of registered connectors.
    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
