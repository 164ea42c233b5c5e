use anyhow::anyhow;
use async_trait::async_trait;
use bidwatch_domain::{DomainError, DomainResult, NotificationDispatcher};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Configuration for the Novu trigger client.
#[derive(Debug, Clone)]
pub struct NovuConfig {
    /// API base, e.g. `https://api.novu.co`.
    pub api_url: String,
    pub api_key: String,
    /// Per-request timeout. A hung trigger call stalls the consumer loop,
    /// so this is the only bound on it.
    pub timeout: Duration,
}

/// Notification dispatcher over the Novu event trigger API.
pub struct NovuDispatcher {
    http: reqwest::Client,
    config: NovuConfig,
}

#[derive(Serialize)]
struct TriggerRequest<'a> {
    name: &'a str,
    to: TriggerRecipient<'a>,
    payload: &'a Value,
}

#[derive(Serialize)]
struct TriggerRecipient<'a> {
    #[serde(rename = "subscriberId")]
    subscriber_id: &'a str,
}

impl NovuDispatcher {
    pub fn new(config: NovuConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn trigger_url(&self) -> String {
        format!("{}/v1/events/trigger", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl NotificationDispatcher for NovuDispatcher {
    async fn trigger(
        &self,
        workflow_id: &str,
        recipient: &str,
        payload: &Value,
    ) -> DomainResult<()> {
        let request = TriggerRequest {
            name: workflow_id,
            to: TriggerRecipient {
                subscriber_id: recipient,
            },
            payload,
        };

        let response = self
            .http
            .post(self.trigger_url())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("ApiKey {}", self.config.api_key),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| DomainError::Dispatch(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DomainError::Dispatch(anyhow!(
                "trigger rejected with {status}: {body}"
            )));
        }

        debug!(workflow = workflow_id, recipient, "notification triggered");
        Ok(())
    }
}
