use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::KnowledgeConfig;
use crate::error::{PipelineError, PipelineResult};

/// Client for the external knowledge-base query service. Missing
/// configuration is not an error: the feature degrades to no answers.
#[derive(Clone)]
pub struct KnowledgeBase {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl KnowledgeBase {
    pub fn new(config: &KnowledgeConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }

    /// Ask one natural-language question. `Ok(None)` when the service is not
    /// configured; transport/HTTP failures surface so the caller can log and
    /// move on to the next query.
    pub async fn query(&self, question: &str) -> PipelineResult<Option<String>> {
        #[derive(Serialize)]
        struct QueryReq<'a> {
            query: &'a str,
        }

        let (Some(base), Some(api_key)) = (self.base_url.as_deref(), self.api_key.as_deref())
        else {
            return Ok(None);
        };

        let url = format!("{base}/api/query");
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .bearer_auth(api_key)
            .json(&QueryReq { query: question })
            .send()
            .await
            .map_err(|err| PipelineError::Upstream(err.to_string()))?
            .error_for_status()
            .map_err(|err| PipelineError::Upstream(err.to_string()))?;

        let body = response
            .json::<Value>()
            .await
            .map_err(|err| PipelineError::Upstream(err.to_string()))?;

        let answer = body
            .get("answer")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());

        Ok(Some(answer))
    }
}
