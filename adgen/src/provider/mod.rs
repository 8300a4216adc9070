//! Provider adapters: one interface over every external generation vendor.
//!
//! Adapters classify every failure into a [`ProviderError`] so the worker can decide between
//! retrying the job and failing it without knowing anything vendor specific.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{JobId, TaskType};

pub mod http;
pub mod mock;

pub use http::{HttpProvider, HttpProviderConfig};
pub use mock::MockProvider;

/// Opaque vendor output (text, media reference, ...) stored as the job result.
pub type GenerationOutput = serde_json::Value;

/// What an adapter is asked to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub task: TaskType,
    /// Cost table key, e.g. `text-variations`
    pub operation: String,
    pub input: serde_json::Value,
}

/// Classified adapter failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials rejected. Retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The vendor rejected the input. Retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Whether another attempt (on this or a later job attempt) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::UpstreamUnavailable(_) | ProviderError::Timeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::InvalidInput(_) => "invalid_input",
            ProviderError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProviderError::Timeout(_) => "timeout",
        }
    }
}

/// A single external generation vendor.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError>;
}

/// Adapters by configured name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one [`HttpProvider`] per configured entry.
    pub fn from_config(configs: &HashMap<String, HttpProviderConfig>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for (name, config) in configs {
            registry.register(Arc::new(HttpProvider::new(name.clone(), config.clone())?));
        }
        Ok(registry)
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            tracing::warn!(provider = %name, "Replacing already registered provider");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
