//! Capability registry: stored definitions to executable, validated calls
//!
//! A capability is configured data until a request needs it. The registry
//! turns a [`CapabilityRecord`] plus the request's security context into an
//! [`Executable`]: arguments are validated against the compiled input shape
//! before any outbound work, the caller credential is injected only at the
//! transport boundary (never visible to the handler's reasoning step), and
//! downstream failures come back as structured [`EngineError::Execution`]
//! values rather than raw transport errors.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::TenantCache;
use crate::error::EngineError;
use crate::provider::ToolSpec;
use crate::schema::CompiledShape;
use crate::store::{CapabilityCategory, CapabilityRecord, ConfigStore};

const CACHE_CATEGORY: &str = "capability";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request security context bound into executables.
///
/// The credential is attached to outbound calls as a bearer token; it is
/// never part of the tool spec the model sees.
#[derive(Clone)]
pub struct SecurityContext {
    pub tenant_id: String,
    credential: String,
}

impl SecurityContext {
    pub fn new(tenant_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            credential: credential.into(),
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.credential)
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("tenant_id", &self.tenant_id)
            .field("credential", &"***")
            .finish()
    }
}

/// Structured-query collaborator (e.g. a read-only data service)
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(&self, config: &Value, args: &Value) -> Result<Value, EngineError>;
}

/// Unstructured knowledge retrieval collaborator (the vector subsystem)
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, config: &Value, args: &Value) -> Result<Value, EngineError>;
}

/// Parsed remote-call invocation configuration
#[derive(Debug, Clone)]
struct RemoteCallConfig {
    base_url: String,
    endpoint: String,
    method: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl RemoteCallConfig {
    fn parse(config: &Value) -> Self {
        let headers = config
            .get("headers")
            .and_then(|h| h.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            base_url: config
                .get("base_url")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            endpoint: config
                .get("endpoint")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            method: config
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("GET")
                .to_uppercase(),
            headers,
            timeout: config
                .get("timeout_secs")
                .and_then(|v| v.as_u64())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
        }
    }
}

enum Invoker {
    RemoteCall {
        client: Client,
        config: RemoteCallConfig,
    },
    StructuredQuery {
        backend: Arc<dyn QueryBackend>,
        config: Value,
    },
    KnowledgeLookup {
        search: Arc<dyn KnowledgeSearch>,
        config: Value,
    },
}

/// One built capability: validate-then-invoke
pub struct Executable {
    capability_id: Uuid,
    name: String,
    description: String,
    input_shape: Value,
    shape: CompiledShape,
    format: Option<String>,
    invoker: Invoker,
    context: SecurityContext,
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("capability_id", &self.capability_id)
            .field("name", &self.name)
            .field("format", &self.format)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Executable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability_id(&self) -> Uuid {
        self.capability_id
    }

    /// Output format override declared by the capability, if any
    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Signature exposed to the handler's reasoning step.
    /// Carries no configuration and no credential.
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_shape.clone(),
        }
    }

    /// Validate arguments and invoke the capability.
    ///
    /// On validation failure no outbound call is made.
    pub async fn invoke(&self, args: &Value) -> Result<Value, EngineError> {
        self.shape.validate(args)?;

        let result = match &self.invoker {
            Invoker::RemoteCall { client, config } => {
                self.remote_call(client, config, args).await
            }
            Invoker::StructuredQuery { backend, config } => backend.query(config, args).await,
            Invoker::KnowledgeLookup { search, config } => search.search(config, args).await,
        };

        match result {
            Ok(value) => {
                info!(
                    capability = %self.name,
                    tenant_id = %self.context.tenant_id,
                    "capability invoked"
                );
                Ok(value)
            }
            Err(EngineError::Execution(detail)) => {
                error!(
                    capability = %self.name,
                    tenant_id = %self.context.tenant_id,
                    detail,
                    "capability invocation failed"
                );
                Err(EngineError::Execution(format!(
                    "capability '{}' is temporarily unavailable",
                    self.name
                )))
            }
            Err(other) => Err(other),
        }
    }

    async fn remote_call(
        &self,
        client: &Client,
        config: &RemoteCallConfig,
        args: &Value,
    ) -> Result<Value, EngineError> {
        let empty = Map::new();
        let args = args.as_object().unwrap_or(&empty);

        let (path, consumed) = substitute_path(&config.endpoint, args);
        let full_url = format!("{}{}", config.base_url, path);
        let url = Url::parse(&full_url)
            .map_err(|e| EngineError::Execution(format!("invalid endpoint url {full_url}: {e}")))?;

        // Arguments not consumed by path substitution travel as query
        // parameters (GET) or the request body (POST)
        let remaining: Map<String, Value> = args
            .iter()
            .filter(|(k, _)| !consumed.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        debug!(
            capability = %self.name,
            method = %config.method,
            tenant_id = %self.context.tenant_id,
            "outbound call"
        );

        let mut request = match config.method.as_str() {
            "POST" => client.post(url).json(&Value::Object(remaining)),
            _ => {
                let pairs: Vec<(String, String)> = remaining
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_query_value(v)))
                    .collect();
                client.get(url).query(&pairs)
            }
        };

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        // Credential injection happens here and nowhere else
        request = request.header("Authorization", self.context.bearer());
        request = request.timeout(config.timeout);

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Execution(format!("transport error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Execution(format!(
                "upstream returned {status}: {body}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::Execution(format!("invalid upstream payload: {e}")))
    }
}

/// Replace `{name}` placeholders in an endpoint template with argument
/// values; returns the substituted path and the consumed argument names.
fn substitute_path(endpoint: &str, args: &Map<String, Value>) -> (String, Vec<String>) {
    let mut path = endpoint.to_string();
    let mut consumed = Vec::new();
    for (name, value) in args {
        let placeholder = format!("{{{name}}}");
        if path.contains(&placeholder) {
            path = path.replace(&placeholder, &json_to_query_value(value));
            consumed.push(name.clone());
        }
    }
    (path, consumed)
}

fn json_to_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds executables from stored definitions, with a tenant-scoped record
/// cache in front of the configuration store.
#[derive(Clone)]
pub struct CapabilityRegistry {
    store: Arc<dyn ConfigStore>,
    cache: TenantCache,
    client: Client,
    query_backend: Option<Arc<dyn QueryBackend>>,
    knowledge: Option<Arc<dyn KnowledgeSearch>>,
}

impl CapabilityRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, cache: TenantCache) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            store,
            cache,
            client,
            query_backend: None,
            knowledge: None,
        }
    }

    pub fn with_query_backend(mut self, backend: Arc<dyn QueryBackend>) -> Self {
        self.query_backend = Some(backend);
        self
    }

    pub fn with_knowledge_search(mut self, search: Arc<dyn KnowledgeSearch>) -> Self {
        self.knowledge = Some(search);
        self
    }

    /// Build an executable for one capability under the given security
    /// context.
    ///
    /// The record may come from the tenant cache; the permission check
    /// always goes to the authoritative store, so a revoked capability is
    /// unreachable regardless of cache state.
    pub async fn build(
        &self,
        capability_id: Uuid,
        context: &SecurityContext,
    ) -> Result<Executable, EngineError> {
        let tenant_id = context.tenant_id.clone();

        if !self
            .store
            .capability_enabled(&tenant_id, capability_id)
            .await?
        {
            return Err(EngineError::NotFound(format!(
                "capability {capability_id} is not enabled for this tenant"
            )));
        }

        let record = self.load_record(&tenant_id, capability_id).await?;
        if !record.active {
            return Err(EngineError::NotFound(format!(
                "capability {capability_id} is inactive"
            )));
        }

        let shape = CompiledShape::compile(&record.input_shape)?;

        let invoker = match record.category {
            CapabilityCategory::RemoteCall => Invoker::RemoteCall {
                client: self.client.clone(),
                config: RemoteCallConfig::parse(&record.config),
            },
            CapabilityCategory::StructuredQuery => Invoker::StructuredQuery {
                backend: self.query_backend.clone().ok_or_else(|| {
                    EngineError::Execution("no structured-query backend configured".to_string())
                })?,
                config: record.config.clone(),
            },
            CapabilityCategory::KnowledgeLookup => Invoker::KnowledgeLookup {
                search: self.knowledge.clone().ok_or_else(|| {
                    EngineError::Execution("no knowledge-search backend configured".to_string())
                })?,
                config: record.config.clone(),
            },
        };

        debug!(
            capability = %record.name,
            tenant_id,
            category = ?record.category,
            "built executable"
        );

        Ok(Executable {
            capability_id,
            name: record.name,
            description: record.description,
            input_shape: record.input_shape,
            shape,
            format: record.default_format,
            invoker,
            context: context.clone(),
        })
    }

    async fn load_record(
        &self,
        tenant_id: &str,
        capability_id: Uuid,
    ) -> Result<CapabilityRecord, EngineError> {
        let key = capability_id.to_string();

        if let Some(cached) = self.cache.get(tenant_id, CACHE_CATEGORY, &key).await {
            match serde_json::from_value::<CapabilityRecord>(cached) {
                Ok(record) => return Ok(record),
                Err(e) => {
                    warn!(tenant_id, %capability_id, error = %e, "stale cached capability record, refetching");
                    self.cache.invalidate(tenant_id, CACHE_CATEGORY, &key).await;
                }
            }
        }

        let record = self
            .store
            .capability_by_id(capability_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("capability {capability_id} not found"))
            })?;

        if let Ok(value) = serde_json::to_value(&record) {
            self.cache.set(tenant_id, CACHE_CATEGORY, &key, value).await;
        }

        Ok(record)
    }

    /// Drop the cached record for one capability under one tenant
    pub async fn invalidate(&self, tenant_id: &str, capability_id: Uuid) {
        self.cache
            .invalidate(tenant_id, CACHE_CATEGORY, &capability_id.to_string())
            .await;
    }
}
