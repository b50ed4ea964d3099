use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{PipelineError, PipelineResult};

/// Client for the Ollama-style text completion endpoint. Streaming is off so
/// responses arrive as one JSON body.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: Option<String>,
    model: String,
    timeout: Duration,
    extract_timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            extract_timeout: Duration::from_secs(config.extract_timeout_secs),
        }
    }

    /// Primary analysis/generation call with the long timeout.
    pub async fn generate(&self, prompt: &str) -> PipelineResult<String> {
        self.generate_with_timeout(prompt, self.timeout).await
    }

    /// Auxiliary call path (key-fact extraction) with the short timeout.
    pub async fn generate_auxiliary(&self, prompt: &str) -> PipelineResult<String> {
        self.generate_with_timeout(prompt, self.extract_timeout).await
    }

    async fn generate_with_timeout(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> PipelineResult<String> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| PipelineError::Config("OLLAMA_BASE_URL not configured".to_string()))?;

        let url = format!("{base}/api/generate");
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&GenerateReq {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|err| classify_transport_error(err, timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream(format!(
                "LLM endpoint returned {status}: {}",
                normalize_err_body(&body)
            )));
        }

        let decoded = response
            .json::<GenerateResp>()
            .await
            .map_err(|err| PipelineError::Upstream(format!("bad LLM response body: {err}")))?;

        Ok(decoded.response.trim().to_string())
    }
}

fn classify_transport_error(err: reqwest::Error, timeout: Duration) -> PipelineError {
    if err.is_timeout() {
        PipelineError::UpstreamTimeout(timeout.as_secs())
    } else {
        PipelineError::Upstream(err.to_string())
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn unconfigured() -> LlmClient {
        LlmClient::new(&LlmConfig {
            base_url: None,
            model: "qwen3:14b".to_string(),
            timeout_secs: 300,
            extract_timeout_secs: 60,
        })
    }

    #[tokio::test]
    async fn missing_base_url_is_a_config_error() {
        let err = unconfigured().generate("hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn error_body_prefers_embedded_message() {
        assert_eq!(
            normalize_err_body(r#"{"error": "model not found"}"#),
            "model not found"
        );
        assert_eq!(normalize_err_body(""), "<empty body>");
        assert_eq!(normalize_err_body("plain text"), "plain text");
    }
}
