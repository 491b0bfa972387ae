//! TOML seed format for the in-memory configuration store
//!
//! The seed file declares tenants, handlers, capabilities, bindings,
//! permissions, and output formats by name; ids are minted at load time
//! and the name references resolved while building the store.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use switchboard_core::{
    CapabilityBinding, CapabilityCategory, CapabilityRecord, HandlerRecord, MemoryStore,
    OutputFormatRecord,
};

#[derive(Debug, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub tenants: Vec<String>,
    #[serde(default)]
    pub handlers: Vec<HandlerSeed>,
    #[serde(default)]
    pub capabilities: Vec<CapabilitySeed>,
    #[serde(default)]
    pub bindings: Vec<BindingSeed>,
    #[serde(default)]
    pub formats: Vec<FormatSeed>,
}

#[derive(Debug, Deserialize)]
pub struct HandlerSeed {
    pub name: String,
    pub description: String,
    pub prompt_template: String,
    pub model: String,
    #[serde(default = "default_format")]
    pub default_format: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Tenants granted this handler; empty means every seeded tenant
    #[serde(default)]
    pub tenants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilitySeed {
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub input_shape: Value,
    pub default_format: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub tenants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindingSeed {
    pub handler: String,
    pub capability: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
pub struct FormatSeed {
    pub name: String,
    #[serde(default)]
    pub render_hint: Value,
}

fn default_format() -> String {
    "summary_text".to_string()
}

fn default_true() -> bool {
    true
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))
    }

    /// Build a populated store. Name references are resolved here so a
    /// binding to an undeclared handler or capability fails loudly.
    pub async fn build_store(&self) -> Result<MemoryStore> {
        let store = MemoryStore::new();

        let mut handler_ids: HashMap<&str, Uuid> = HashMap::new();
        for seed in &self.handlers {
            let record = HandlerRecord {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                description: seed.description.clone(),
                prompt_template: seed.prompt_template.clone(),
                model: seed.model.clone(),
                default_format: seed.default_format.clone(),
                active: seed.active,
                created_at: Utc::now(),
            };
            handler_ids.insert(seed.name.as_str(), record.id);
            let id = record.id;
            store.add_handler(record).await;
            for tenant in self.granted_tenants(&seed.tenants) {
                store.set_handler_permission(tenant, id, true).await;
            }
        }

        let mut capability_ids: HashMap<&str, Uuid> = HashMap::new();
        for seed in &self.capabilities {
            let category = parse_category(&seed.category)
                .with_context(|| format!("capability '{}'", seed.name))?;
            let record = CapabilityRecord {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                description: seed.description.clone(),
                category,
                config: seed.config.clone(),
                input_shape: normalize_shape(&seed.input_shape),
                default_format: seed.default_format.clone(),
                active: seed.active,
                created_at: Utc::now(),
            };
            capability_ids.insert(seed.name.as_str(), record.id);
            let id = record.id;
            store.add_capability(record).await;
            for tenant in self.granted_tenants(&seed.tenants) {
                store.set_capability_permission(tenant, id, true).await;
            }
        }

        for seed in &self.bindings {
            let handler_id = *handler_ids
                .get(seed.handler.as_str())
                .ok_or_else(|| anyhow!("binding references unknown handler '{}'", seed.handler))?;
            let capability_id = *capability_ids.get(seed.capability.as_str()).ok_or_else(|| {
                anyhow!("binding references unknown capability '{}'", seed.capability)
            })?;
            store
                .add_binding(CapabilityBinding {
                    handler_id,
                    capability_id,
                    priority: seed.priority,
                    created_at: Utc::now(),
                })
                .await;
        }

        for seed in &self.formats {
            store
                .add_output_format(OutputFormatRecord {
                    name: seed.name.clone(),
                    render_hint: seed.render_hint.clone(),
                })
                .await;
        }

        Ok(store)
    }

    fn granted_tenants<'a>(&'a self, explicit: &'a [String]) -> impl Iterator<Item = &'a str> {
        let grants = if explicit.is_empty() {
            &self.tenants
        } else {
            explicit
        };
        grants.iter().map(String::as_str)
    }
}

fn parse_category(raw: &str) -> Result<CapabilityCategory> {
    match raw {
        "remote_call" => Ok(CapabilityCategory::RemoteCall),
        "structured_query" => Ok(CapabilityCategory::StructuredQuery),
        "knowledge_lookup" => Ok(CapabilityCategory::KnowledgeLookup),
        other => Err(anyhow!(
            "unknown capability category '{other}' \
             (expected remote_call, structured_query, or knowledge_lookup)"
        )),
    }
}

/// A seed omitting the input shape means no arguments
fn normalize_shape(shape: &Value) -> Value {
    if shape.is_null() {
        json!({"properties": {}})
    } else {
        shape.clone()
    }
}

pub fn default_seed() -> &'static str {
    r#"# switchboard seed data

tenants = ["default"]

[[formats]]
name = "summary_text"
render_hint = { type = "text" }

[[formats]]
name = "structured_json"
render_hint = { type = "json" }

[[handlers]]
name = "general"
description = "general questions that fit no specialized domain"
prompt_template = "You are a helpful assistant. Answer concisely."
model = "claude-sonnet-4-5"
default_format = "summary_text"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::ConfigStore;

    const SEED: &str = r#"
tenants = ["acme", "globex"]

[[handlers]]
name = "billing"
description = "billing questions"
prompt_template = "Answer billing questions."
model = "claude-sonnet-4-5"
default_format = "structured_json"
tenants = ["acme"]

[[capabilities]]
name = "get_balance"
description = "fetch an account balance"
category = "structured_query"
config = { table = "balances" }
tenants = ["acme"]

[capabilities.input_shape.properties.code]
type = "string"
pattern = "[0-9]{10}"

[[bindings]]
handler = "billing"
capability = "get_balance"
priority = 1

[[formats]]
name = "structured_json"
render_hint = { type = "json" }
"#;

    #[tokio::test]
    async fn test_seed_builds_store_with_scoped_permissions() {
        let seed: Seed = toml::from_str(SEED).unwrap();
        let store = seed.build_store().await.unwrap();

        let acme = store.enabled_handlers("acme").await.unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].name, "billing");

        // globex is seeded but not granted billing
        let globex = store.enabled_handlers("globex").await.unwrap();
        assert!(globex.is_empty());
    }

    #[tokio::test]
    async fn test_seed_resolves_binding_names() {
        let seed: Seed = toml::from_str(SEED).unwrap();
        let store = seed.build_store().await.unwrap();

        let handler = store.handler_by_name("billing").await.unwrap().unwrap();
        let bindings = store.bindings_for_handler(handler.id).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].priority, 1);
    }

    #[tokio::test]
    async fn test_unknown_binding_target_fails() {
        let seed: Seed = toml::from_str(
            r#"
tenants = ["acme"]

[[bindings]]
handler = "nope"
capability = "missing"
"#,
        )
        .unwrap();
        assert!(seed.build_store().await.is_err());
    }

    #[test]
    fn test_default_seed_parses() {
        let seed: Seed = toml::from_str(default_seed()).unwrap();
        assert_eq!(seed.tenants, vec!["default"]);
        assert_eq!(seed.handlers.len(), 1);
    }

    #[test]
    fn test_unknown_category_rejected() {
        assert!(parse_category("shell_command").is_err());
    }
}
