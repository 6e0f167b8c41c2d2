//! Control-plane client.
//!
//! Intentionally limited to enqueue-only operations plus history reads; the
//! client talks to the runtime exclusively through the shared [`Provider`],
//! so it can live in any process with access to the store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::status::{status_from_history, HistorySnapshot};
use crate::runtime::{OrchestrationStatus, WaitError};

pub struct Client {
    provider: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Start an orchestration instance under a caller-supplied instance id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input: input.into(),
                },
                None,
            )
            .await
    }

    /// Start an orchestration with a generated instance id; returns the id.
    pub async fn start_orchestration_new(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ProviderError> {
        let instance = format!("{orchestration}-{}", crate::generate_guid());
        self.start_orchestration(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Start an orchestration with a JSON-encoded typed input.
    pub async fn start_orchestration_typed<T: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &T,
    ) -> Result<(), ProviderError> {
        let payload = Json::encode(input)
            .map_err(|e| ProviderError::permanent("start_orchestration_typed", e))?;
        self.start_orchestration(instance, orchestration, payload)
            .await
    }

    /// Deliver an external event to a running instance.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        data: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.to_string(),
                    data: data.into(),
                },
                None,
            )
            .await
    }

    /// Cancel an instance. The coordinator records a cancellation marker and
    /// stops replaying; in-flight activities finish but their results are
    /// discarded on arrival.
    pub async fn cancel_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await
    }

    /// Status of the instance's latest execution.
    pub async fn get_status(&self, instance: &str) -> OrchestrationStatus {
        let history = self.provider.read(instance).await;
        status_from_history(&history)
    }

    /// Latest orchestration-defined status payload, if any.
    pub async fn get_custom_status(&self, instance: &str) -> Option<String> {
        let history = self.provider.read(instance).await;
        HistorySnapshot::from_history(&history).custom_status
    }

    /// Poll until the instance reaches a terminal status or the timeout
    /// elapses. Continue-as-new is not terminal; waiting follows the
    /// instance into its next execution.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
