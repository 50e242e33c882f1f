//! LLM Service - ordered provider fallback over cached clients
//!
//! ```text
//! chat(route, messages, tools)
//!   attempts = dedup([route.provider, ...route.fallback_order])
//!   for kind in attempts:
//!       client = cache[(kind, api_key)] or factory.create(kind)
//!       client.chat(..) ── Ok ──► return
//!                       └─ Err ─► warn, next
//!   Err(AllProvidersFailed { last })
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use super::provider::{
    LlmProvider, ProviderFactory, ProviderKind, ProviderSettings, DEFAULT_LOCAL_MODEL,
};
use super::types::{ChatMessage, ChatRequest, ChatResponse, ToolDefinition};
use crate::error::LlmError;
use crate::metrics::{LLM_CALL_DURATION, LLM_PROVIDER_FAILURES};

/// LLM routing and connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub fallback_order: Vec<ProviderKind>,
    /// Model for the primary provider; provider default when unset
    pub model: Option<String>,
    pub providers: HashMap<ProviderKind, ProviderSettings>,
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            fallback_order: Vec::new(),
            model: None,
            providers: HashMap::new(),
            request_timeout_secs: 120,
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The service-wide default route.
    pub fn route(&self) -> LlmRoute {
        LlmRoute {
            provider: self.provider,
            fallback_order: self.fallback_order.clone(),
            model: self.model.clone(),
        }
    }

    pub fn settings(&self, kind: ProviderKind) -> ProviderSettings {
        self.providers.get(&kind).cloned().unwrap_or_default()
    }
}

/// Which providers one chat call may use, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRoute {
    pub provider: ProviderKind,
    pub fallback_order: Vec<ProviderKind>,
    pub model: Option<String>,
}

impl LlmRoute {
    /// `[provider, ...fallback_order]` with later duplicates dropped.
    pub fn attempt_order(&self) -> Vec<ProviderKind> {
        let mut order = Vec::with_capacity(1 + self.fallback_order.len());
        for kind in std::iter::once(self.provider).chain(self.fallback_order.iter().copied()) {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }
}

/// A `name:tag` model string.
fn is_versioned_model(model: &str) -> bool {
    matches!(model.split_once(':'), Some((name, tag)) if !name.is_empty() && !tag.is_empty())
}

type CacheKey = (ProviderKind, Option<String>);

/// Provider fallback over a client cache keyed by `(provider, api_key)`.
pub struct LlmService {
    config: LlmConfig,
    factory: Arc<dyn ProviderFactory>,
    clients: Mutex<HashMap<CacheKey, Arc<dyn LlmProvider>>>,
}

impl LlmService {
    pub fn new(config: LlmConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            config,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Model for one attempt.
    ///
    /// The primary provider gets the route's model. A fallback to a local
    /// provider keeps the route's model only if it is a versioned `name:tag`
    /// string and otherwise uses [`DEFAULT_LOCAL_MODEL`]. Other fallbacks use
    /// their configured model.
    pub fn model_for_attempt(&self, route: &LlmRoute, kind: ProviderKind) -> String {
        let configured = || {
            self.config
                .settings(kind)
                .model
                .unwrap_or_else(|| kind.default_model().to_string())
        };
        if kind == route.provider {
            return route.model.clone().unwrap_or_else(configured);
        }
        if kind.is_local() {
            return match &route.model {
                Some(m) if is_versioned_model(m) => m.clone(),
                _ => DEFAULT_LOCAL_MODEL.to_string(),
            };
        }
        configured()
    }

    fn client_for(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let settings = self.config.settings(kind);
        let key = (kind, settings.api_key.clone());

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.create(kind, &settings)?;
        debug!(provider = %kind, "created provider client");
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Number of cached provider clients.
    pub fn cached_clients(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Run one chat turn, falling back through the route's providers.
    pub async fn chat(
        &self,
        route: &LlmRoute,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, LlmError> {
        let attempts = route.attempt_order();
        let mut last_error: Option<LlmError> = None;

        for kind in &attempts {
            let kind = *kind;
            let request = ChatRequest {
                model: self.model_for_attempt(route, kind),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                temperature: self.config.temperature,
            };

            let span = info_span!("llm_call", provider = %kind, model = %request.model);
            let started = Instant::now();
            let result = async {
                let client = self.client_for(kind)?;
                client.chat(&request).await
            }
            .instrument(span)
            .await;
            LLM_CALL_DURATION
                .with_label_values(&[kind.as_str()])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(mut response) => {
                    if response.provider.is_empty() {
                        response.provider = kind.to_string();
                    }
                    if response.model.is_empty() {
                        response.model = request.model;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    LLM_PROVIDER_FAILURES.with_label_values(&[kind.as_str()]).inc();
                    warn!(provider = %kind, model = %request.model, error = %e, "LLM provider failed, trying next in fallback chain");
                    last_error = Some(e);
                }
            }
        }

        Err(LlmError::AllProvidersFailed {
            attempts: attempts.len(),
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers configured".to_string()),
        })
    }
}
