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

//! LLM-as-judge metric producer
//!
//! Renders a prompt template against the target, asks the client for a
//! `{ value, reasoning, confidence }` object and validates the reply against
//! the metric's declared value type. Any malformed reply is a hard error.

use crate::llm_client::{LLMClient, StructuredRequest};
use crate::metric::{MeasureContext, MetricOutput};
use crate::target::Target;
use crate::EvalError;
use evalflow_core::{RawValue, ValueType};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const SCHEMA_NAME: &str = "record_judgement";

/// Judge producer backed by an [`LLMClient`]
pub struct LlmJudge {
    client: Arc<dyn LLMClient>,
    prompt_template: String,
    system_prompt: Option<String>,
    choices: Option<Vec<String>>,
}

impl LlmJudge {
    /// Template placeholders: `{input}`, `{output}`, `{expected}`,
    /// `{conversation}`, `{tool_calls}`, `{metadata}`
    pub fn new(client: Arc<dyn LLMClient>, prompt_template: impl Into<String>) -> Self {
        Self {
            client,
            prompt_template: prompt_template.into(),
            system_prompt: None,
            choices: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Restrict string/ordinal replies to these labels
    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn choices(&self) -> Option<&[String]> {
        self.choices.as_deref()
    }

    /// Everything that shapes the request apart from the target
    pub fn fingerprint(&self) -> Value {
        json!({
            "model": self.client.model_name(),
            "prompt": self.prompt_template,
            "system": self.system_prompt,
            "choices": self.choices,
        })
    }

    /// Substitutes placeholders in a single pass, so inserted text is never
    /// scanned again. Unknown `{...}` sequences are kept as written.
    pub fn render_prompt(&self, target: &Target<'_>, ctx: &MeasureContext<'_>) -> String {
        let mut rendered = String::with_capacity(self.prompt_template.len());
        let mut rest = self.prompt_template.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let tail = &rest[open..];
            let placeholder = tail.find('}').and_then(|close| {
                placeholder_value(&tail[1..close], target, ctx).map(|value| (close, value))
            });

            match placeholder {
                Some((close, value)) => {
                    rendered.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = &tail[1..];
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }

    /// JSON schema of the reply object for a metric of `value_type`
    pub fn response_schema(&self, value_type: ValueType) -> Value {
        let value_schema = match (value_type, &self.choices) {
            (ValueType::Number, _) => json!({ "type": "number" }),
            (ValueType::Boolean, _) => json!({ "type": "boolean" }),
            (ValueType::String | ValueType::Ordinal, Some(choices)) => {
                json!({ "type": "string", "enum": choices })
            }
            (ValueType::String, None) => json!({ "type": "string" }),
            (ValueType::Ordinal, None) => json!({ "type": "integer" }),
        };

        json!({
            "type": "object",
            "properties": {
                "value": value_schema,
                "reasoning": { "type": ["string", "null"] },
                "confidence": { "type": ["number", "null"], "minimum": 0, "maximum": 1 }
            },
            "required": ["value", "reasoning", "confidence"],
            "additionalProperties": false
        })
    }

    pub async fn judge(
        &self,
        metric: &str,
        value_type: ValueType,
        target: &Target<'_>,
        ctx: &MeasureContext<'_>,
    ) -> Result<MetricOutput, EvalError> {
        let mut request = StructuredRequest::new(
            self.render_prompt(target, ctx),
            SCHEMA_NAME,
            self.response_schema(value_type),
        );
        if let Some(system) = &self.system_prompt {
            request = request.with_system(system.clone());
        }

        let response = self.client.generate_structured(request).await?;

        let (input_cost, output_cost) = self.client.cost_per_token();
        tracing::debug!(
            metric,
            target = ctx.target_id,
            model = %response.model,
            tokens = response.usage.total_tokens,
            cost = response.usage.calculate_cost(input_cost, output_cost),
            "LLM judgement received"
        );

        self.parse_reply(metric, value_type, &response.content)
    }

    fn parse_reply(
        &self,
        metric: &str,
        value_type: ValueType,
        reply: &Value,
    ) -> Result<MetricOutput, EvalError> {
        let object = reply
            .as_object()
            .ok_or_else(|| EvalError::producer(metric, "reply is not a JSON object"))?;

        let value = object
            .get("value")
            .ok_or_else(|| EvalError::producer(metric, "reply has no 'value' field"))?;

        let raw_value = match (value_type, value) {
            (ValueType::Number, Value::Number(n)) => n.as_f64().map(RawValue::Number),
            (ValueType::Boolean, Value::Bool(b)) => Some(RawValue::Bool(*b)),
            (ValueType::String | ValueType::Ordinal, Value::String(s)) => {
                Some(RawValue::String(s.clone()))
            }
            (ValueType::Ordinal, Value::Number(n)) => n.as_f64().map(RawValue::Number),
            _ => None,
        }
        .ok_or_else(|| {
            EvalError::producer(
                metric,
                format!("reply value {} is not a valid {}", value, value_type),
            )
        })?;

        if let Some(choices) = &self.choices {
            let key = raw_value.category_key();
            if !choices.contains(&key) {
                return Err(EvalError::producer(
                    metric,
                    format!("reply value '{}' is not one of {:?}", key, choices),
                ));
            }
        }

        let confidence = match object.get("confidence") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_f64() {
                Some(c) if (0.0..=1.0).contains(&c) => Some(c),
                _ => {
                    return Err(EvalError::producer(
                        metric,
                        format!("confidence {} is outside [0, 1]", n),
                    ))
                }
            },
            Some(other) => {
                return Err(EvalError::producer(
                    metric,
                    format!("confidence {} is not a number", other),
                ))
            }
        };

        let reasoning = match object.get("reasoning") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(EvalError::producer(
                    metric,
                    format!("reasoning {} is not a string", other),
                ))
            }
        };

        Ok(MetricOutput {
            raw_value,
            confidence,
            reasoning,
        })
    }
}

impl fmt::Debug for LlmJudge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmJudge")
            .field("model", &self.client.model_name())
            .field("prompt_template", &self.prompt_template)
            .field("choices", &self.choices)
            .finish()
    }
}

fn placeholder_value(name: &str, target: &Target<'_>, ctx: &MeasureContext<'_>) -> Option<String> {
    let value = match name {
        "input" => target.input().to_string(),
        "output" => target.output().to_string(),
        "expected" => target.expected().unwrap_or("").to_string(),
        "conversation" => target.transcript(),
        "tool_calls" => serde_json::to_string(&target.tool_calls()).unwrap_or_default(),
        "metadata" => {
            let metadata: BTreeMap<&String, &Value> = ctx.metadata.iter().collect();
            serde_json::to_string(&metadata).unwrap_or_default()
        }
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{LLMError, LLMResponse, TokenUsage};
    use async_trait::async_trait;
    use evalflow_core::{Container, DatasetItem};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MockLLMClient {
        reply: Value,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLLMClient {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMClient for MockLLMClient {
        async fn generate_structured(
            &self,
            request: StructuredRequest,
        ) -> Result<LLMResponse, LLMError> {
            self.prompts.lock().push(request.prompt);
            Ok(LLMResponse {
                content: self.reply.clone(),
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: 120,
                },
                model: "mock-model".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }

        fn cost_per_token(&self) -> (f64, f64) {
            (0.0, 0.0)
        }
    }

    async fn run_judge(judge: &LlmJudge, value_type: ValueType) -> Result<MetricOutput, EvalError> {
        let container: Container = DatasetItem::new("What is 2+2?", "4").with_expected("4").into();
        let metadata = HashMap::from([("run".to_string(), json!("nightly"))]);
        let target = match &container {
            Container::Item(item) => Target::Item(item),
            _ => unreachable!(),
        };
        let ctx = MeasureContext {
            container: &container,
            container_index: 0,
            target_id: "q1",
            metadata: &metadata,
        };
        judge.judge("judge", value_type, &target, &ctx).await
    }

    #[tokio::test]
    async fn test_prompt_rendering_and_number_reply() {
        let client =
            MockLLMClient::new(json!({ "value": 4, "reasoning": "correct", "confidence": 0.9 }));
        let judge = LlmJudge::new(
            client.clone(),
            "Q: {input}\nA: {output}\nRef: {expected}\nMeta: {metadata}",
        );

        let output = run_judge(&judge, ValueType::Number).await.unwrap();
        assert_eq!(output.raw_value, RawValue::Number(4.0));
        assert_eq!(output.confidence, Some(0.9));
        assert_eq!(output.reasoning.as_deref(), Some("correct"));

        let prompts = client.prompts.lock();
        assert_eq!(prompts[0], "Q: What is 2+2?\nA: 4\nRef: 4\nMeta: {\"run\":\"nightly\"}");
    }

    #[tokio::test]
    async fn test_wrong_value_type_rejected() {
        let client =
            MockLLMClient::new(json!({ "value": "four", "reasoning": null, "confidence": null }));
        let judge = LlmJudge::new(client, "{output}");

        let err = run_judge(&judge, ValueType::Number).await.unwrap_err();
        assert!(matches!(err, EvalError::Producer { .. }));
    }

    #[tokio::test]
    async fn test_confidence_out_of_range_rejected() {
        let client =
            MockLLMClient::new(json!({ "value": true, "reasoning": null, "confidence": 1.5 }));
        let judge = LlmJudge::new(client, "{output}");

        let err = run_judge(&judge, ValueType::Boolean).await.unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"));
    }

    #[tokio::test]
    async fn test_unknown_ordinal_choice_rejected() {
        let client = MockLLMClient::new(json!({
            "value": "excellent",
            "reasoning": null,
            "confidence": null
        }));
        let judge = LlmJudge::new(client, "{output}")
            .with_choices(vec!["low".into(), "medium".into(), "high".into()]);

        let err = run_judge(&judge, ValueType::Ordinal).await.unwrap_err();
        assert!(err.to_string().contains("not one of"));
    }

    #[test]
    fn test_inserted_text_is_not_rendered_again() {
        let judge = LlmJudge::new(
            MockLLMClient::new(Value::Null),
            "A: {output} Ref: {expected} {other}",
        );
        let container: Container = DatasetItem::new("q", "see {expected} and {input}")
            .with_expected("secret")
            .into();
        let metadata = HashMap::new();
        let target = match &container {
            Container::Item(item) => Target::Item(item),
            _ => unreachable!(),
        };
        let ctx = MeasureContext {
            container: &container,
            container_index: 0,
            target_id: "q1",
            metadata: &metadata,
        };

        assert_eq!(
            judge.render_prompt(&target, &ctx),
            "A: see {expected} and {input} Ref: secret {other}"
        );
    }

    #[test]
    fn test_fingerprint_tracks_request_settings() {
        let client = MockLLMClient::new(Value::Null);
        let base = LlmJudge::new(client.clone(), "{output}");

        assert_eq!(base.fingerprint(), LlmJudge::new(client.clone(), "{output}").fingerprint());
        assert_ne!(base.fingerprint(), LlmJudge::new(client.clone(), "{input}").fingerprint());
        assert_ne!(
            base.fingerprint(),
            LlmJudge::new(client.clone(), "{output}").with_system_prompt("be strict").fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            LlmJudge::new(client, "{output}").with_choices(vec!["a".into()]).fingerprint()
        );
        assert_eq!(base.fingerprint()["model"], json!("mock-model"));
    }

    #[test]
    fn test_schema_uses_choices() {
        let client = MockLLMClient::new(Value::Null);
        let judge = LlmJudge::new(client, "").with_choices(vec!["a".into(), "b".into()]);
        let schema = judge.response_schema(ValueType::Ordinal);
        assert_eq!(schema["properties"]["value"]["enum"], json!(["a", "b"]));
        assert_eq!(schema["additionalProperties"], json!(false));
    }
}
