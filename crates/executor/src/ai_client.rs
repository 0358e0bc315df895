//! `coordination::ai_client::AiClient` backed by `rig-core`'s OpenAI-compatible
//! completions client, grounded on the donor's `config::ClientSet`.
//!
//! This is the only module that touches `rig` types directly — the anomaly
//! analyzer and gate-recovery strategist see nothing but `complete(prompt)`.

use async_trait::async_trait;
use coordination::ai_client::{AiClient, AiClientError};
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;

use crate::config::AiEndpointConfig;

pub struct RigAiClient {
    client: openai::CompletionsClient,
    model: String,
}

impl RigAiClient {
    pub fn new(config: &AiEndpointConfig) -> anyhow::Result<Self> {
        let client = openai::CompletionsClient::builder()
            .api_key(&config.api_key)
            .base_url(&config.base_url)
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl AiClient for RigAiClient {
    async fn complete(&self, prompt: &str) -> Result<String, AiClientError> {
        let agent = self.client.agent(&self.model).build();
        agent
            .prompt(prompt)
            .await
            .map_err(|e| AiClientError::Transient(e.to_string()))
    }
}
