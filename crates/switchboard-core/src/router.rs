//! Intent router (supervisor)
//!
//! Classifies an inbound message against the tenant's enabled handlers and
//! either selects exactly one, rejects as multi-intent, or asks for
//! clarification. Classification is delegated to the reasoning model,
//! constrained to emit one handler name or a sentinel; anything the model
//! says that is not one of those maps to the unclear outcome.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::provider::{ModelProvider, ProviderMessage};
use crate::store::{ConfigStore, HandlerRecord};

const MULTI_INTENT: &str = "MULTI_INTENT";
const UNCLEAR: &str = "UNCLEAR";

const DEFAULT_ROUTER_MODEL: &str = "claude-sonnet-4-5";

/// Terminal outcome of one routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Exactly one handler matched
    Route(String),
    /// Two or more requests mapping to different handlers; carries the
    /// best-effort detected topics for the clarification message
    MultiIntent(Vec<String>),
    /// Ambiguous, off-topic, or unparseable
    Unclear,
}

/// Supervisor that routes messages to domain handlers
#[derive(Clone)]
pub struct IntentRouter {
    store: Arc<dyn ConfigStore>,
    provider: Arc<dyn ModelProvider>,
    model: String,
}

impl IntentRouter {
    pub fn new(store: Arc<dyn ConfigStore>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            store,
            provider,
            model: DEFAULT_ROUTER_MODEL.to_string(),
        }
    }

    /// Bind the routing step to a specific model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Classify one message for one tenant.
    ///
    /// A tenant with no enabled handlers short-circuits to
    /// [`RouteDecision::Unclear`] without a provider call.
    pub async fn route(&self, tenant_id: &str, message: &str) -> Result<RouteDecision, EngineError> {
        let handlers = self.store.enabled_handlers(tenant_id).await?;
        if handlers.is_empty() {
            debug!(tenant_id, "no enabled handlers, routing unclear");
            return Ok(RouteDecision::Unclear);
        }

        let system = build_supervisor_prompt(&handlers);
        let messages = vec![ProviderMessage::text("user", message)];

        let reply = self
            .provider
            .chat(&self.model, &system, &messages, &[])
            .await?;

        let decision = parse_decision(&reply.text(), &handlers, message);
        info!(tenant_id, decision = ?decision_label(&decision), "message routed");
        Ok(decision)
    }
}

/// Build the classification instruction from the tenant's enabled handlers
fn build_supervisor_prompt(handlers: &[HandlerRecord]) -> String {
    let mut prompt = String::from(
        "You are a supervisor that routes user queries to specialized domain handlers.\n\n\
         Available handlers:\n",
    );
    for handler in handlers {
        prompt.push_str(&format!("- {}: {}\n", handler.name, handler.description));
    }
    prompt.push_str(
        "\nYour task:\n\
         1. Analyze the user's message carefully\n\
         2. Detect whether the message contains ONE or MULTIPLE distinct questions\n\
         3. Respond with ONLY the handler name or a status code\n\n\
         Detection rules:\n\
         - A message with a single question, or several related facets of one \
         handler's domain, is a SINGLE intent: respond with that handler's name.\n\
         - A message combining two or more questions that belong to DIFFERENT \
         handlers is MULTIPLE intents: respond with \"MULTI_INTENT\".\n\
         - An ambiguous or nonsensical message, or one unrelated to every \
         available handler, gets \"UNCLEAR\".\n\n\
         Respond with exactly one of the handler names above, \"MULTI_INTENT\", \
         or \"UNCLEAR\". No explanations, no additional text.",
    );
    prompt
}

/// Map the model's raw reply to a decision.
///
/// Only an exact handler name or sentinel is accepted; everything else is
/// unclear.
fn parse_decision(raw: &str, handlers: &[HandlerRecord], message: &str) -> RouteDecision {
    let trimmed = raw.trim().trim_matches('"');

    if trimmed.eq_ignore_ascii_case(MULTI_INTENT) {
        return RouteDecision::MultiIntent(detect_topics(handlers, message));
    }
    if trimmed.eq_ignore_ascii_case(UNCLEAR) {
        return RouteDecision::Unclear;
    }
    if let Some(handler) = handlers.iter().find(|h| h.name.eq_ignore_ascii_case(trimmed)) {
        return RouteDecision::Route(handler.name.clone());
    }

    warn!(reply = trimmed, "unrecognized routing reply, treating as unclear");
    RouteDecision::Unclear
}

/// Best-effort topic detection for the multi-intent clarification: handler
/// names whose name or description words appear in the message.
fn detect_topics(handlers: &[HandlerRecord], message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    handlers
        .iter()
        .filter(|h| {
            lower.contains(&h.name.to_lowercase())
                || h.description
                    .to_lowercase()
                    .split_whitespace()
                    .any(|word| word.len() > 3 && lower.contains(word))
        })
        .map(|h| h.name.clone())
        .collect()
}

fn decision_label(decision: &RouteDecision) -> &'static str {
    match decision {
        RouteDecision::Route(_) => "route",
        RouteDecision::MultiIntent(_) => "multi_intent",
        RouteDecision::Unclear => "unclear",
    }
}
