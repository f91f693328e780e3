use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::Value;
use tracing::warn;

use crate::domain::errors::LLMError;
use crate::domain::ports::{Deadline, LLMClient, StructuredChatRequest, StructuredResponse};
use crate::infrastructure::core::CircuitBreaker;

/// Generic structured-output chat client against an OpenAI-compatible `/chat/completions`
/// endpoint. Retries transient transport failures via `reqwest-retry`; wraps the whole call in a
/// [`CircuitBreaker`] so a sustained upstream outage fails fast instead of burning every trader's
/// decision-cycle deadline on a provider that is already down.
pub struct HttpLLMClient {
    client: reqwest_middleware::ClientWithMiddleware,
    api_base: String,
    api_key: String,
    circuit_breaker: CircuitBreaker,
}

impl HttpLLMClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            circuit_breaker: CircuitBreaker::new("llm_client", 5, 2, Duration::from_secs(30)),
        }
    }
}

#[async_trait]
impl LLMClient for HttpLLMClient {
    async fn chat_structured(
        &self,
        request: StructuredChatRequest,
        schema: &Value,
        deadline: Deadline,
    ) -> Result<StructuredResponse, LLMError> {
        let body = serde_json::json!({
            "model": request.model_alias,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "decision_list", "schema": schema, "strict": true },
            },
        });

        let call = self.send(body, deadline);
        match self.circuit_breaker.call(call).await {
            Ok(response) => Ok(response),
            Err(crate::infrastructure::core::circuit_breaker::CircuitBreakerError::Open(msg)) => {
                warn!("LLM circuit breaker open: {msg}");
                Err(LLMError::Upstream(msg))
            }
            Err(crate::infrastructure::core::circuit_breaker::CircuitBreakerError::Inner(e)) => Err(e),
        }
    }
}

impl HttpLLMClient {
    async fn send(&self, body: Value, deadline: Deadline) -> Result<StructuredResponse, LLMError> {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));

        let response = tokio::time::timeout(
            deadline,
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| LLMError::Timeout)?
        .map_err(|e| LLMError::Upstream(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LLMError::Unauthorized);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LLMError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::Upstream(format!("status {status}: {text}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LLMError::Upstream(e.to_string()))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LLMError::SchemaViolation("missing choices[0].message.content".into()))?
            .to_string();
        let tokens_used = payload["usage"]["total_tokens"].as_u64().map(|t| t as u32);

        Ok(StructuredResponse {
            raw_text: content,
            tokens_used,
        })
    }
}
