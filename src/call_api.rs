use crate::config::Config;
use crate::protocol::{CallTicket, InitiateCallResponse};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Obtains room credentials for an outbound call.
#[async_trait]
pub trait CallInitiator: Send + Sync {
    async fn initiate_call(&self, target_user_id: &str) -> anyhow::Result<CallTicket>;
}

/// REST client for the backend's `initiate-call` endpoint.
pub struct CallApi {
    client: Client,
    endpoint: String,
    api_token: String,
    device_id: String,
}

impl CallApi {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/initiate-call", config.api_url.trim_end_matches('/')),
            api_token: config.api_token.to_string(),
            device_id: config.device_id.clone(),
        })
    }
}

#[async_trait]
impl CallInitiator for CallApi {
    async fn initiate_call(&self, target_user_id: &str) -> anyhow::Result<CallTicket> {
        log::info!("Requesting call to {} via {}", target_user_id, self.endpoint);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Device-Id", &self.device_id)
            .json(&json!({ "to_user": target_user_id }));
        if !self.api_token.is_empty() {
            request = request.bearer_auth(&self.api_token);
        }

        let resp = request.send().await.context("Call initiation request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Call initiation rejected: HTTP {} {}", status, body.trim());
        }

        let body: InitiateCallResponse = resp
            .json()
            .await
            .context("Call initiation response is not valid JSON")?;
        let ticket = CallTicket::try_from(body)?;
        log::info!(
            "Call {} assigned room {} for {}",
            ticket.call_id,
            ticket.room_name,
            target_user_id
        );
        Ok(ticket)
    }
}
