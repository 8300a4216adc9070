//! Provider fallback chain.
//!
//! Adapters for a task are tried in configured order; the first success wins. Every failure
//! along the way is kept, so a job that ends up failing reports all of its causes.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::provider::{GenerationOutput, GenerationRequest, ProviderError, ProviderRegistry};
use crate::types::TaskType;

/// One adapter's failure inside a chain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Successful chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    /// Name of the adapter that produced the output
    pub provider: String,
    pub output: GenerationOutput,
    /// Failures from adapters tried before the winner, in order
    pub failures: Vec<ProviderFailure>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("all providers failed: {}", format_causes(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),

    #[error("no providers configured for task {0}")]
    NoProvidersConfigured(TaskType),
}

fn format_causes(causes: &[ProviderFailure]) -> String {
    causes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl OrchestratorError {
    /// A later job attempt may succeed if at least one cause was transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::AllProvidersFailed(causes) => causes.iter().any(|c| c.error.is_retryable()),
            OrchestratorError::NoProvidersConfigured(_) => false,
        }
    }

    pub fn causes(&self) -> &[ProviderFailure] {
        match self {
            OrchestratorError::AllProvidersFailed(causes) => causes,
            OrchestratorError::NoProvidersConfigured(_) => &[],
        }
    }

    /// The cause reported to users: the last adapter's error.
    pub fn last_cause(&self) -> String {
        match self.causes().last() {
            Some(cause) => cause.to_string(),
            None => self.to_string(),
        }
    }
}

/// Ordered adapter lists per task, resolved against a registry.
#[derive(Clone, Default)]
pub struct ProviderChain {
    registry: ProviderRegistry,
    chains: HashMap<TaskType, Vec<String>>,
}

impl ProviderChain {
    pub fn new(registry: ProviderRegistry, chains: HashMap<TaskType, Vec<String>>) -> Self {
        Self { registry, chains }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Configured order for `task`.
    pub fn chain(&self, task: TaskType) -> &[String] {
        self.chains.get(&task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run the chain for `task`, or only `explicit_provider` when one is requested.
    #[tracing::instrument(skip(self, request), fields(job_id = %request.job_id, task = %task))]
    pub async fn run(
        &self,
        task: TaskType,
        request: &GenerationRequest,
        explicit_provider: Option<&str>,
    ) -> Result<ProviderResult, OrchestratorError> {
        let candidates: Vec<&str> = match explicit_provider {
            Some(name) => vec![name],
            None => self.chain(task).iter().map(String::as_str).collect(),
        };

        let mut failures = Vec::new();

        for name in candidates {
            let Some(provider) = self.registry.get(name) else {
                tracing::warn!(provider = %name, "Provider in chain is not registered, skipping");
                continue;
            };

            tracing::debug!(provider = %name, "Trying provider");
            match provider.generate(request).await {
                Ok(output) => {
                    if !failures.is_empty() {
                        tracing::info!(provider = %name, fallbacks = failures.len(), "Provider succeeded after fallback");
                    }
                    return Ok(ProviderResult {
                        provider: name.to_string(),
                        output,
                        failures,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        provider = %name,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Provider failed, falling back"
                    );
                    failures.push(ProviderFailure {
                        provider: name.to_string(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Err(OrchestratorError::NoProvidersConfigured(task));
        }
        Err(OrchestratorError::AllProvidersFailed(failures))
    }
}
