//! The single guarded path every model call goes through.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use evoflow_core::config::RetryConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::event::EventBus;
use evoflow_core::traits::{ModelClient, PricingCatalog};
use evoflow_core::types::{ModelRequest, ModelResponse, WorkflowEvent};
use evoflow_llm::calculate_backoff;

use crate::guard::AdmissionController;

/// A value obtained from the model plus what it cost across all attempts.
#[derive(Debug, Clone)]
pub struct Dispatched<T> {
    pub value: T,
    pub usd_cost: f64,
    pub attempts: u32,
}

/// A dispatch that gave up, with the spend of every billed attempt before it.
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: EvoflowError,
    pub usd_cost: f64,
}

impl DispatchFailure {
    pub fn new(error: EvoflowError, usd_cost: f64) -> Self {
        Self { error, usd_cost }
    }
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for DispatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<EvoflowError> for DispatchFailure {
    fn from(error: EvoflowError) -> Self {
        Self::new(error, 0.0)
    }
}

impl From<DispatchFailure> for EvoflowError {
    fn from(failure: DispatchFailure) -> Self {
        failure.error
    }
}

pub type DispatchResult<T> = std::result::Result<Dispatched<T>, DispatchFailure>;

pub struct ModelDispatcher {
    client: Arc<dyn ModelClient>,
    pricing: Arc<dyn PricingCatalog>,
    admission: Arc<AdmissionController>,
    retry: RetryConfig,
    event_bus: Arc<EventBus>,
}

impl ModelDispatcher {
    pub fn new(
        client: Arc<dyn ModelClient>,
        pricing: Arc<dyn PricingCatalog>,
        admission: Arc<AdmissionController>,
        retry: RetryConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            client,
            pricing,
            admission,
            retry,
            event_bus,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Send a request and return the raw response.
    pub async fn dispatch(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> DispatchResult<ModelResponse> {
        self.dispatch_with(request, cancel, |r| Ok(r.clone())).await
    }

    /// Send a structured request and parse the reply as JSON into `T`.
    ///
    /// A reply that does not parse counts as a failed attempt and is retried.
    pub async fn dispatch_structured<T: DeserializeOwned>(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> DispatchResult<T> {
        self.dispatch_with(request, cancel, |r| {
            let text = r.text();
            serde_json::from_str(extract_json(&text))
                .map_err(|e| EvoflowError::MalformedOutput(format!("{}: {}", e, truncate(&text, 200))))
        })
        .await
    }

    async fn dispatch_with<T>(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        parse: impl Fn(&ModelResponse) -> Result<T>,
    ) -> DispatchResult<T> {
        let pricing = self
            .pricing
            .find_model(&request.model)
            .ok_or_else(|| EvoflowError::UnknownModel(request.model.clone()))?;

        let mut usd_cost = 0.0;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchFailure::new(EvoflowError::Cancelled, usd_cost));
            }

            // Guards are consulted on every attempt, retries included.
            if let Err(rejection) = self.admission.admit() {
                warn!(model = %request.model, reason = %rejection, "Model call refused");
                self.event_bus.publish(WorkflowEvent::AdmissionRejected {
                    rejection: rejection.clone(),
                });
                return Err(DispatchFailure::new(rejection.into(), usd_cost));
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DispatchFailure::new(EvoflowError::Cancelled, usd_cost))
                }
                r = self.client.complete(request.clone()) => r,
            };

            let parsed = outcome.and_then(|response| {
                let cost = pricing.usd_cost(&response.usage);
                self.admission.record_spend(cost);
                usd_cost += cost;
                parse(&response)
            });

            match parsed {
                Ok(value) => {
                    debug!(model = %request.model, attempt, usd_cost, "Model call complete");
                    return Ok(Dispatched {
                        value,
                        usd_cost,
                        attempts: attempt + 1,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry);
                    warn!(
                        model = %request.model,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying model request"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(DispatchFailure::new(EvoflowError::Cancelled, usd_cost))
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(DispatchFailure::new(e, usd_cost)),
            }
        }
    }
}

/// Pull a JSON document out of a model reply (code fences or surrounding prose).
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
