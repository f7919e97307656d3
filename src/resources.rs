use anyhow::Result;

use concept_index_core::models::FieldPolicy;

use crate::config::Config;
use crate::traits::ConnectorRegistry;

/// `cidx resources`: configured resources, their fields and whether the
/// connector root is reachable.
pub fn list_resources(config: &Config) -> Result<()> {
    let registry = ConnectorRegistry::from_config(config)?;
    if registry.is_empty() {
        println!("No resources configured.");
        return Ok(());
    }

    println!("{:<16} {:<8} {:<8} {:<10} FIELDS", "RESOURCE", "TYPE", "LARGE", "STATUS");
    for connector in registry.connectors() {
        let structure = connector.describe_structure();
        let status = match config.resources.get(connector.resource_id()) {
            Some(r) if !r.root.exists() => "NO ROOT",
            _ => "OK",
        };
        let fields: Vec<String> = structure
            .fields
            .iter()
            .map(|f| {
                let policy = match &f.policy {
                    FieldPolicy::Recognize => "recognize".to_string(),
                    FieldPolicy::Reported { ontology } => format!("reported:{}", ontology),
                    FieldPolicy::Skip => "skip".to_string(),
                };
                format!("{}={}({})", f.name, f.weight, policy)
            })
            .collect();
        println!(
            "{:<16} {:<8} {:<8} {:<10} {}",
            connector.resource_id(),
            connector.connector_type(),
            structure.large,
            status,
            fields.join(" ")
        );
    }
    Ok(())
}
