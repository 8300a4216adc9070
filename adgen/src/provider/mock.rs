//! Scripted provider for tests and local development.
//!
//! Outcomes are returned in FIFO order. An outcome added with a trigger holds its caller until
//! the returned sender fires, which lets tests observe how many generations run at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{GenerationOutput, GenerationRequest, Provider, ProviderError};

pub type MockOutcome = Result<GenerationOutput, ProviderError>;

struct Scripted {
    outcome: MockOutcome,
    trigger: Option<oneshot::Receiver<()>>,
}

#[derive(Clone)]
pub struct MockProvider {
    name: String,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    /// Returned once the script is exhausted
    fallback: Arc<Mutex<Option<MockOutcome>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<GenerationRequest>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(None)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for the next unscripted call.
    pub fn add_response(&self, outcome: MockOutcome) {
        self.script.lock().push_back(Scripted { outcome, trigger: None });
    }

    /// Queue an outcome that is only returned once the sender fires (or is dropped).
    pub fn add_response_with_trigger(&self, outcome: MockOutcome) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().push_back(Scripted {
            outcome,
            trigger: Some(rx),
        });
        tx
    }

    /// Outcome for every call after the script runs out.
    pub fn always(&self, outcome: MockOutcome) {
        *self.fallback.lock() = Some(outcome);
    }

    pub fn get_calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn fallback_outcome(&self) -> MockOutcome {
        self.fallback.lock().clone().unwrap_or_else(|| {
            Err(ProviderError::UpstreamUnavailable(format!(
                "no mock response configured for {}",
                self.name
            )))
        })
    }

    /// Calls currently inside `generate`.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        self.calls.lock().push(request.clone());

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let next = self.script.lock().pop_front();
        let outcome = match next {
            Some(Scripted { outcome, trigger }) => {
                if let Some(trigger) = trigger {
                    // A dropped sender releases the call as well
                    let _ = trigger.await;
                }
                outcome
            }
            None => self.fallback_outcome(),
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use serde_json::json;
    use uuid::Uuid;

    fn request() -> GenerationRequest {
        GenerationRequest {
            job_id: Uuid::new_v4(),
            task: TaskType::Text,
            operation: "text".to_string(),
            input: json!({"prompt": "headline for running shoes"}),
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_fifo_then_fallback() {
        let mock = MockProvider::new("openai");
        mock.add_response(Err(ProviderError::Timeout("first".into())));
        mock.add_response(Ok(json!("second")));

        assert!(matches!(mock.generate(&request()).await, Err(ProviderError::Timeout(_))));
        assert_eq!(mock.generate(&request()).await.unwrap(), json!("second"));
        assert!(matches!(
            mock.generate(&request()).await,
            Err(ProviderError::UpstreamUnavailable(_))
        ));

        mock.always(Ok(json!("steady")));
        assert_eq!(mock.generate(&request()).await.unwrap(), json!("steady"));
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_trigger_holds_call_in_flight() {
        let mock = MockProvider::new("openai");
        let trigger = mock.add_response_with_trigger(Ok(json!("done")));

        let handle = {
            let mock = mock.clone();
            tokio::spawn(async move { mock.generate(&request()).await })
        };

        let start = tokio::time::Instant::now();
        while mock.in_flight_count() == 0 && start.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), json!("done"));
        assert_eq!(mock.in_flight_count(), 0);
    }
}
