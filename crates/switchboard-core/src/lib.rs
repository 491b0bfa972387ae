//! switchboard-core - Multi-tenant agent routing and orchestration engine
//!
//! This crate provides:
//! - Intent router that classifies each message to exactly one domain handler,
//!   or rejects it as multi-intent or unclear
//! - Capability registry building schema-validated, credential-scoped
//!   executables from stored definitions
//! - Tenant-scoped cache with namespaced keys that degrades to a miss when
//!   the backing store is unavailable
//! - Bounded context window over the full conversation transcript
//! - Agent resolver assembling a handler with its visible capability set
//! - Execution pipeline tying it all together under a wall-clock budget

pub mod cache;
pub mod capability;
pub mod context;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod resolver;
pub mod router;
pub mod schema;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheStore, MemoryCache, TenantCache};
pub use capability::{
    CapabilityRegistry, Executable, KnowledgeSearch, QueryBackend, SecurityContext,
};
pub use context::{bounded_window, DEFAULT_WINDOW};
pub use error::EngineError;
pub use pipeline::{Pipeline, PipelineConfig, DEFAULT_BUDGET};
pub use provider::{HttpProvider, ModelProvider, ProviderMessage, ProviderReply, ToolSpec};
pub use resolver::{AgentResolver, ResolvedHandler, VisibleCapability};
pub use router::{IntentRouter, RouteDecision};
pub use store::{
    CapabilityBinding, CapabilityCategory, CapabilityRecord, ConfigStore, HandlerRecord,
    MemoryStore, MemoryTranscripts, OutputFormatRecord, TranscriptStore,
};
pub use types::{ChatMessage, ChatRole, NormalizedResponse, ResponseStatus};
