use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{OrchflowError, Result};

use super::{AgentRuntime, DispatchRequest};

/// Agent runtime reached over HTTP.
///
/// Dispatches are posted as JSON to `{endpoint}/runs`, aborts to
/// `{endpoint}/runs/{id}/abort`. Any non-2xx status is a dispatch error.
pub struct HttpAgentRuntime {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAgentRuntime {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build().map_err(|e| OrchflowError::Dispatch(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<()> {
        let url = format!("{}/runs", self.endpoint);
        debug!(%url, agent_run_id = %request.run_id, "posting dispatch");

        self.client
            .post(&url)
            .json(request)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| OrchflowError::Dispatch(e.to_string()))?;
        Ok(())
    }

    async fn abort(
        &self,
        agent_run_id: &str,
    ) -> Result<()> {
        let url = format!("{}/runs/{}/abort", self.endpoint, agent_run_id);

        self.client.post(&url).send().await.and_then(|resp| resp.error_for_status()).map_err(|e| OrchflowError::Dispatch(e.to_string()))?;
        Ok(())
    }
}
