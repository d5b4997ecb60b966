//! Fire-and-forget trigger for the external indexing worker.

use crate::config::WorkerConfig;
use crate::worker::types::TriggerRequest;

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use std::time::Duration;

/// Starts index construction somewhere else.
///
/// Returning `Ok` means the worker accepted the request. The outcome arrives
/// later through the completion callback.
#[async_trait]
pub trait IndexWorker: Send + Sync {
    async fn trigger(&self, request: &TriggerRequest) -> anyhow::Result<()>;
}

/// Worker reached by POSTing a JSON [`TriggerRequest`].
pub struct HttpIndexWorker {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpIndexWorker {
    pub fn new(config: &WorkerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl IndexWorker for HttpIndexWorker {
    async fn trigger(&self, request: &TriggerRequest) -> anyhow::Result<()> {
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key);
        }

        let response = call
            .send()
            .await
            .with_context(|| format!("failed to reach indexing worker at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("indexing worker rejected trigger ({status}): {}", body.trim());
        }

        tracing::info!(
            job_id = %request.job_id,
            file_id = %request.file_id,
            %status,
            "indexing worker accepted trigger"
        );
        Ok(())
    }
}
