//! Agent resolver: handler name to effective definition
//!
//! Resolution joins the handler row, the tenant's permission rows, and the
//! capability bindings into one cached value: the instruction template, the
//! bound model, and the visible capability set — the top five enabled
//! bindings by ascending priority. Priority governs visibility only; which
//! visible capability actually runs is the handler's own choice.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TenantCache;
use crate::error::EngineError;
use crate::store::ConfigStore;

const CACHE_CATEGORY: &str = "handler";

/// Number of capability bindings exposed to a handler's reasoning step
pub const VISIBLE_CAPABILITY_LIMIT: usize = 5;

/// One capability visible to a resolved handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibleCapability {
    pub capability_id: Uuid,
    pub name: String,
    pub priority: i32,
}

/// Effective handler definition for one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedHandler {
    pub id: Uuid,
    pub name: String,
    pub prompt_template: String,
    pub model: String,
    pub default_format: String,
    /// Top bindings by ascending priority, already permission-filtered.
    /// Empty is valid: a pure-reasoning handler has no capabilities.
    pub visible: Vec<VisibleCapability>,
}

/// Resolves handler definitions with a tenant-scoped cache in front of the
/// configuration store.
#[derive(Clone)]
pub struct AgentResolver {
    store: Arc<dyn ConfigStore>,
    cache: TenantCache,
}

impl AgentResolver {
    pub fn new(store: Arc<dyn ConfigStore>, cache: TenantCache) -> Self {
        Self { store, cache }
    }

    /// Resolve a handler by routing name for one tenant.
    ///
    /// Fails with [`EngineError::NotFound`] when the handler is absent,
    /// inactive, or lacks an enabled permission row for the tenant.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        handler_name: &str,
    ) -> Result<ResolvedHandler, EngineError> {
        if let Some(cached) = self.cache.get(tenant_id, CACHE_CATEGORY, handler_name).await {
            match serde_json::from_value::<ResolvedHandler>(cached) {
                Ok(resolved) => return Ok(resolved),
                Err(e) => {
                    warn!(tenant_id, handler_name, error = %e, "stale cached resolution, refetching");
                    self.cache
                        .invalidate(tenant_id, CACHE_CATEGORY, handler_name)
                        .await;
                }
            }
        }

        let resolved = self.resolve_uncached(tenant_id, handler_name).await?;

        if let Ok(value) = serde_json::to_value(&resolved) {
            self.cache
                .set(tenant_id, CACHE_CATEGORY, handler_name, value)
                .await;
        }

        Ok(resolved)
    }

    async fn resolve_uncached(
        &self,
        tenant_id: &str,
        handler_name: &str,
    ) -> Result<ResolvedHandler, EngineError> {
        let handler = self
            .store
            .handler_by_name(handler_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("handler '{handler_name}' not found")))?;

        if !handler.active {
            return Err(EngineError::NotFound(format!(
                "handler '{handler_name}' is inactive"
            )));
        }

        // Enabled means an enabled permission row exists for this tenant;
        // the active flag alone is never enough.
        if !self.store.handler_enabled(tenant_id, handler.id).await? {
            return Err(EngineError::NotFound(format!(
                "handler '{handler_name}' is not enabled for this tenant"
            )));
        }

        let bindings = self.store.bindings_for_handler(handler.id).await?;

        // Filter to capabilities the tenant may use, then keep the top
        // five. Equal priorities break by creation time, then id, so the
        // visible set is deterministic regardless of call order.
        let mut candidates = Vec::new();
        for binding in bindings {
            if !self
                .store
                .capability_enabled(tenant_id, binding.capability_id)
                .await?
            {
                continue;
            }
            let record = match self.store.capability_by_id(binding.capability_id).await? {
                Some(record) if record.active => record,
                _ => continue,
            };
            candidates.push((binding, record.name));
        }

        candidates.sort_by(|(a, _), (b, _)| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.capability_id.cmp(&b.capability_id))
        });
        candidates.truncate(VISIBLE_CAPABILITY_LIMIT);

        let visible: Vec<VisibleCapability> = candidates
            .into_iter()
            .map(|(binding, name)| VisibleCapability {
                capability_id: binding.capability_id,
                name,
                priority: binding.priority,
            })
            .collect();

        info!(
            tenant_id,
            handler = handler_name,
            visible = visible.len(),
            "handler resolved"
        );

        Ok(ResolvedHandler {
            id: handler.id,
            name: handler.name,
            prompt_template: handler.prompt_template,
            model: handler.model,
            default_format: handler.default_format,
            visible,
        })
    }

    /// Drop the cached resolution for one handler under one tenant
    pub async fn invalidate(&self, tenant_id: &str, handler_name: &str) {
        debug!(tenant_id, handler_name, "invalidating cached resolution");
        self.cache
            .invalidate(tenant_id, CACHE_CATEGORY, handler_name)
            .await;
    }
}
