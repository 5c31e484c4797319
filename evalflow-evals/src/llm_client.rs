// Copyright 2025 Evalflow Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! LLM client abstraction for judge metrics

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert evaluator. Respond only with valid JSON.";

/// Trait for LLM clients used by judge metrics
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Generate a JSON object that follows `request.schema`
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<LLMResponse, LLMError>;

    /// Get model name
    fn model_name(&self) -> &str;

    /// Get cost per token (input, output)
    fn cost_per_token(&self) -> (f64, f64);
}

/// A structured-generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Identifier for the schema (tool name / json_schema name)
    pub schema_name: String,
    /// JSON Schema the reply must satisfy
    pub schema: serde_json::Value,
}

impl StructuredRequest {
    pub fn new(
        prompt: impl Into<String>,
        schema_name: impl Into<String>,
        schema: serde_json::Value,
    ) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            schema_name: schema_name.into(),
            schema,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    fn system_prompt(&self) -> &str {
        self.system.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

/// Response from LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Parsed JSON object returned by the model
    pub content: serde_json::Value,
    pub usage: TokenUsage,
    pub model: String,
}

impl LLMResponse {
    /// Get a specific field from the response object
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.content.get(key)
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Calculate cost based on per-token pricing
    pub fn calculate_cost(&self, cost_per_input: f64, cost_per_output: f64) -> f64 {
        (self.prompt_tokens as f64 * cost_per_input)
            + (self.completion_tokens as f64 * cost_per_output)
    }
}

/// Errors from LLM clients
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LLMError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LLMError::RateLimitExceeded);
    }
    let error_text = response.text().await?;
    Err(LLMError::ApiError(format!("{}: {}", status, error_text)))
}

fn token_count(value: &serde_json::Value) -> u32 {
    value.as_u64().unwrap_or(0) as u32
}

/// OpenAI-compatible chat completions client
pub struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<LLMResponse, LLMError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": request.system_prompt()
                },
                {
                    "role": "user",
                    "content": request.prompt
                }
            ],
            "temperature": 0.0,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true
                }
            }
        });

        tracing::debug!(
            model = %self.model,
            schema = %request.schema_name,
            "OpenAI structured request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let response_data: serde_json::Value = check_status(response).await?.json().await?;

        let text = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(LLMError::InvalidResponse("Missing content".to_string()))?;
        let content: serde_json::Value = serde_json::from_str(text)?;

        let usage_data = &response_data["usage"];
        let usage = TokenUsage {
            prompt_tokens: token_count(&usage_data["prompt_tokens"]),
            completion_tokens: token_count(&usage_data["completion_tokens"]),
            total_tokens: token_count(&usage_data["total_tokens"]),
        };

        Ok(LLMResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        match self.model.as_str() {
            "gpt-4o" => (0.0000025, 0.000010),        // $2.50/$10 per 1M
            "gpt-4o-mini" => (0.00000015, 0.0000006), // $0.15/$0.60 per 1M
            "gpt-4-turbo" => (0.000010, 0.000030),    // $10/$30 per 1M
            _ => (0.00000015, 0.0000006),
        }
    }
}

/// Anthropic messages client; structured output via a forced tool call
pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.anthropic.com/v1".to_string(),
            max_tokens: 1024,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<LLMResponse, LLMError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system_prompt(),
            "messages": [
                {
                    "role": "user",
                    "content": request.prompt
                }
            ],
            "tools": [
                {
                    "name": request.schema_name,
                    "description": "Record the evaluation result",
                    "input_schema": request.schema
                }
            ],
            "tool_choice": { "type": "tool", "name": request.schema_name },
            "temperature": 0.0
        });

        tracing::debug!(
            model = %self.model,
            schema = %request.schema_name,
            "Anthropic structured request"
        );

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let response_data: serde_json::Value = check_status(response).await?.json().await?;

        let content = response_data["content"]
            .as_array()
            .and_then(|blocks| {
                blocks.iter().find(|block| {
                    block["type"] == "tool_use" && block["name"] == request.schema_name.as_str()
                })
            })
            .map(|block| block["input"].clone())
            .ok_or(LLMError::InvalidResponse("Missing tool_use block".to_string()))?;

        let input_tokens = token_count(&response_data["usage"]["input_tokens"]);
        let output_tokens = token_count(&response_data["usage"]["output_tokens"]);
        let usage = TokenUsage {
            prompt_tokens: input_tokens,
            completion_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
        };

        Ok(LLMResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        match self.model.as_str() {
            "claude-3-5-haiku-20241022" => (0.0000008, 0.000004), // $0.80/$4 per 1M
            _ => (0.000003, 0.000015),                            // $3/$15 per 1M
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "value": { "type": "number" } },
            "required": ["value"]
        })
    }

    #[test]
    fn test_token_usage_cost() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
        };

        // 100 * 0.00000015 + 50 * 0.0000006 = 0.000045
        let cost = usage.calculate_cost(0.00000015, 0.0000006);
        assert!((cost - 0.000045).abs() < 0.0000001);
    }

    #[test]
    fn test_openai_cost_per_token() {
        let client = OpenAIClient::new("test".to_string(), "gpt-4o-mini".to_string());
        let (input, output) = client.cost_per_token();

        assert_eq!(input, 0.00000015);
        assert_eq!(output, 0.0000006);
    }

    #[tokio::test]
    async fn test_openai_structured_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "response_format": { "type": "json_schema", "json_schema": { "name": "judgement" } }
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{ "message": { "content": "{\"value\": 4}" } }],
                    "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = OpenAIClient::new("sk-test".to_string(), "gpt-4o-mini".to_string())
            .with_base_url(server.url());
        let response = client
            .generate_structured(StructuredRequest::new("rate it", "judgement", schema()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.get("value"), Some(&serde_json::json!(4)));
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_openai_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .create_async()
            .await;

        let client = OpenAIClient::new("sk".to_string(), "gpt-4o".to_string())
            .with_base_url(server.url());
        let err = client
            .generate_structured(StructuredRequest::new("x", "judgement", schema()))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_anthropic_forced_tool_use() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "tool_choice": { "type": "tool", "name": "judgement" }
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "content": [
                        { "type": "text", "text": "thinking" },
                        { "type": "tool_use", "name": "judgement", "input": { "value": 0.8 } }
                    ],
                    "usage": { "input_tokens": 20, "output_tokens": 5 }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client =
            AnthropicClient::new("key".to_string(), "claude-3-5-haiku-20241022".to_string())
                .with_base_url(server.url());
        let response = client
            .generate_structured(StructuredRequest::new("rate", "judgement", schema()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, serde_json::json!({ "value": 0.8 }));
        assert_eq!(response.usage.total_tokens, 25);
    }

    #[tokio::test]
    async fn test_anthropic_missing_tool_block() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .with_status(200)
            .with_body(r#"{"content": [{"type": "text", "text": "no"}], "usage": {}}"#)
            .create_async()
            .await;

        let client = AnthropicClient::new("key".to_string(), "claude".to_string())
            .with_base_url(server.url());
        let err = client
            .generate_structured(StructuredRequest::new("rate", "judgement", schema()))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::InvalidResponse(_)));
    }
}
