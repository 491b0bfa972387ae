//! Configuration and transcript store interfaces
//!
//! The relational store that holds handler, capability, binding, and
//! permission rows is an external collaborator: this core only reads it.
//! Writes happen through the admin surface, which is expected to call
//! [`crate::pipeline::Pipeline::reload`] after mutating configuration.
//!
//! [`MemoryStore`] and [`MemoryTranscripts`] are the in-process
//! implementations used by the CLI and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::ChatMessage;

/// Capability category; one executable variant exists per category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    /// Outbound HTTP call against a configured endpoint
    RemoteCall,
    /// Query against a structured data backend
    StructuredQuery,
    /// Unstructured knowledge retrieval (vector search subsystem)
    KnowledgeLookup,
}

/// Domain handler configuration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRecord {
    pub id: Uuid,
    /// Unique routing name (e.g. "billing")
    pub name: String,
    /// Short description shown to the supervisor for classification
    pub description: String,
    /// System instruction template for the handler's reasoning step
    pub prompt_template: String,
    /// Bound model reference
    pub model: String,
    /// Default output format name
    pub default_format: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Capability configuration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: Uuid,
    pub name: String,
    /// Description exposed to the handler's reasoning step
    pub description: String,
    pub category: CapabilityCategory,
    /// Invocation configuration (endpoint, method, headers, timeout,
    /// collection name — category-specific)
    pub config: Value,
    /// Input-shape description: field names, types, required-ness, patterns
    pub input_shape: Value,
    /// Optional output format override for results of this capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_format: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Pairs a handler with a capability at a priority.
///
/// Lower priority value means higher visibility rank. Priority governs
/// which capabilities the handler sees, never the order it must call them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityBinding {
    pub handler_id: Uuid,
    pub capability_id: Uuid,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Output format row: declared name plus UI rendering hints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormatRecord {
    pub name: String,
    pub render_hint: Value,
}

/// Read-only view of the tenant configuration store.
///
/// Every query is scoped by tenant where permissions apply; a handler or
/// capability without an enabled permission row must never be resolvable
/// for that tenant.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Look up a handler by its routing name (active or not)
    async fn handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>, EngineError>;

    /// Handlers that are active and enabled for the tenant, for the
    /// supervisor's classification prompt
    async fn enabled_handlers(&self, tenant_id: &str) -> Result<Vec<HandlerRecord>, EngineError>;

    async fn capability_by_id(&self, id: Uuid) -> Result<Option<CapabilityRecord>, EngineError>;

    /// Bindings for a handler, ordered by ascending priority
    async fn bindings_for_handler(
        &self,
        handler_id: Uuid,
    ) -> Result<Vec<CapabilityBinding>, EngineError>;

    async fn handler_enabled(&self, tenant_id: &str, handler_id: Uuid)
        -> Result<bool, EngineError>;

    async fn capability_enabled(
        &self,
        tenant_id: &str,
        capability_id: Uuid,
    ) -> Result<bool, EngineError>;

    async fn output_format(&self, name: &str) -> Result<Option<OutputFormatRecord>, EngineError>;
}

/// Append-only transcript store; full history is the system of record,
/// the bounded window presented to handlers is derived from it.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(
        &self,
        tenant_id: &str,
        session_id: &str,
        message: ChatMessage,
    ) -> Result<(), EngineError>;

    /// Full history for a session in arrival order
    async fn history(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, EngineError>;
}

#[derive(Default)]
struct MemoryStoreState {
    handlers: Vec<HandlerRecord>,
    capabilities: Vec<CapabilityRecord>,
    bindings: Vec<CapabilityBinding>,
    /// (tenant_id, handler_id) -> enabled
    handler_permissions: HashMap<(String, Uuid), bool>,
    /// (tenant_id, capability_id) -> enabled
    capability_permissions: HashMap<(String, Uuid), bool>,
    formats: HashMap<String, OutputFormatRecord>,
}

/// In-memory configuration store, seeded programmatically
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: HandlerRecord) {
        self.state.write().await.handlers.push(handler);
    }

    pub async fn add_capability(&self, capability: CapabilityRecord) {
        self.state.write().await.capabilities.push(capability);
    }

    pub async fn add_binding(&self, binding: CapabilityBinding) {
        self.state.write().await.bindings.push(binding);
    }

    pub async fn set_handler_permission(&self, tenant_id: &str, handler_id: Uuid, enabled: bool) {
        self.state
            .write()
            .await
            .handler_permissions
            .insert((tenant_id.to_string(), handler_id), enabled);
    }

    pub async fn set_capability_permission(
        &self,
        tenant_id: &str,
        capability_id: Uuid,
        enabled: bool,
    ) {
        self.state
            .write()
            .await
            .capability_permissions
            .insert((tenant_id.to_string(), capability_id), enabled);
    }

    pub async fn add_output_format(&self, format: OutputFormatRecord) {
        self.state
            .write()
            .await
            .formats
            .insert(format.name.clone(), format);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>, EngineError> {
        let state = self.state.read().await;
        Ok(state.handlers.iter().find(|h| h.name == name).cloned())
    }

    async fn enabled_handlers(&self, tenant_id: &str) -> Result<Vec<HandlerRecord>, EngineError> {
        let state = self.state.read().await;
        Ok(state
            .handlers
            .iter()
            .filter(|h| {
                h.active
                    && state
                        .handler_permissions
                        .get(&(tenant_id.to_string(), h.id))
                        .copied()
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn capability_by_id(&self, id: Uuid) -> Result<Option<CapabilityRecord>, EngineError> {
        let state = self.state.read().await;
        Ok(state.capabilities.iter().find(|c| c.id == id).cloned())
    }

    async fn bindings_for_handler(
        &self,
        handler_id: Uuid,
    ) -> Result<Vec<CapabilityBinding>, EngineError> {
        let state = self.state.read().await;
        let mut bindings: Vec<CapabilityBinding> = state
            .bindings
            .iter()
            .filter(|b| b.handler_id == handler_id)
            .cloned()
            .collect();
        bindings.sort_by_key(|b| b.priority);
        Ok(bindings)
    }

    async fn handler_enabled(
        &self,
        tenant_id: &str,
        handler_id: Uuid,
    ) -> Result<bool, EngineError> {
        let state = self.state.read().await;
        Ok(state
            .handler_permissions
            .get(&(tenant_id.to_string(), handler_id))
            .copied()
            .unwrap_or(false))
    }

    async fn capability_enabled(
        &self,
        tenant_id: &str,
        capability_id: Uuid,
    ) -> Result<bool, EngineError> {
        let state = self.state.read().await;
        Ok(state
            .capability_permissions
            .get(&(tenant_id.to_string(), capability_id))
            .copied()
            .unwrap_or(false))
    }

    async fn output_format(&self, name: &str) -> Result<Option<OutputFormatRecord>, EngineError> {
        let state = self.state.read().await;
        Ok(state.formats.get(name).cloned())
    }
}

/// In-memory append-only transcript store
#[derive(Clone, Default)]
pub struct MemoryTranscripts {
    state: Arc<RwLock<HashMap<(String, String), Vec<ChatMessage>>>>,
}

impl MemoryTranscripts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscripts {
    async fn append(
        &self,
        tenant_id: &str,
        session_id: &str,
        message: ChatMessage,
    ) -> Result<(), EngineError> {
        self.state
            .write()
            .await
            .entry((tenant_id.to_string(), session_id.to_string()))
            .or_default()
            .push(message);
        Ok(())
    }

    async fn history(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        Ok(self
            .state
            .read()
            .await
            .get(&(tenant_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
