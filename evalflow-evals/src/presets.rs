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

//! Built-in metrics and combiners

use crate::metric::{MetricDefinition, MetricScope};
use crate::scorer::{Combiner, ScorerInput};
use crate::target::Target;
use crate::EvalError;
use evalflow_core::{RawValue, Score, ValueType};
use std::collections::HashMap;

/// Names accepted by [`builtin_metric`]
pub const BUILTIN_METRICS: &[&str] = &[
    "exact_match",
    "contains_expected",
    "output_length",
    "word_count",
    "tool_call_count",
    "step_count",
    "tool_names",
];

/// One-line description of a built-in metric
pub fn description(builtin: &str) -> Option<&'static str> {
    Some(match builtin {
        "exact_match" => "Output equals the expected answer, ignoring surrounding whitespace",
        "contains_expected" => "Output contains the expected answer, case-insensitive",
        "output_length" => "Number of characters in the output",
        "word_count" => "Number of whitespace-separated words in the output",
        "tool_call_count" => "Number of tool calls made in the step",
        "step_count" => "Number of steps in the container",
        "tool_names" => "Name of the last tool called in the container, or 'none'",
        _ => return None,
    })
}

/// Build a built-in code metric under the given name
pub fn builtin_metric(builtin: &str, name: impl Into<String>) -> Option<MetricDefinition> {
    let name = name.into();
    let metric = match builtin {
        "exact_match" => {
            MetricDefinition::code(name, ValueType::Boolean, MetricScope::Single, |t, _| {
                let expected = require_expected(t)?;
                Ok(RawValue::Bool(t.output().trim() == expected.trim()))
            })
        }
        "contains_expected" => {
            MetricDefinition::code(name, ValueType::Boolean, MetricScope::Single, |t, _| {
                let expected = require_expected(t)?;
                Ok(RawValue::Bool(
                    t.output().to_lowercase().contains(&expected.to_lowercase()),
                ))
            })
        }
        "output_length" => {
            MetricDefinition::code(name, ValueType::Number, MetricScope::Single, |t, _| {
                Ok(RawValue::Number(t.output().chars().count() as f64))
            })
        }
        "word_count" => {
            MetricDefinition::code(name, ValueType::Number, MetricScope::Single, |t, _| {
                Ok(RawValue::Number(t.output().split_whitespace().count() as f64))
            })
        }
        "tool_call_count" => {
            MetricDefinition::code(name, ValueType::Number, MetricScope::Single, |t, _| {
                Ok(RawValue::Number(t.tool_calls().len() as f64))
            })
        }
        "step_count" => {
            MetricDefinition::code(name, ValueType::Number, MetricScope::Multi, |_, ctx| {
                Ok(RawValue::Number(ctx.container.step_count() as f64))
            })
        }
        "tool_names" => {
            MetricDefinition::code(name, ValueType::String, MetricScope::Multi, |t, _| {
                let last = t.tool_calls().last().map(|call| call.name.clone());
                Ok(RawValue::String(last.unwrap_or_else(|| "none".to_string())))
            })
        }
        _ => return None,
    };
    Some(metric)
}

fn require_expected<'a>(target: &Target<'a>) -> Result<&'a str, EvalError> {
    target
        .expected()
        .ok_or_else(|| EvalError::data("target has no expected value"))
}

/// Weighted sum of the present inputs.
///
/// With `normalize_weights` the sum is divided by the total weight of the
/// inputs present in the row, so the result stays in `[0, 1]`. Without it the
/// weights are used as given and an out-of-range sum is an error.
pub fn weighted_average(inputs: &[ScorerInput], normalize_weights: bool) -> Combiner {
    let weights: HashMap<String, f64> = inputs
        .iter()
        .map(|input| (input.name().to_string(), input.weight))
        .collect();

    Combiner::new(move |scores| {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (name, score) in scores {
            let weight = weights.get(name).copied().unwrap_or(1.0);
            total += weight * score.value();
            weight_sum += weight;
        }

        if normalize_weights {
            if weight_sum <= 0.0 {
                return Err(EvalError::data("weighted average has zero total weight"));
            }
            Ok(Score::clamped(total / weight_sum)?)
        } else {
            Ok(Score::new(total)?)
        }
    })
}

/// Lowest present input score
pub fn minimum() -> Combiner {
    Combiner::new(|scores| {
        scores
            .values()
            .copied()
            .min_by(|a, b| a.value().total_cmp(&b.value()))
            .ok_or_else(|| EvalError::data("minimum of no scores"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MeasureContext;
    use evalflow_core::{Container, Conversation, ConversationStep, DatasetItem, ToolCall};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn measure(
        metric: &MetricDefinition,
        container: &Container,
        target: Target<'_>,
    ) -> Result<RawValue, EvalError> {
        let metadata = HashMap::new();
        let ctx = MeasureContext {
            container,
            container_index: 0,
            target_id: "t",
            metadata: &metadata,
        };
        metric.produce(&target, &ctx).await.map(|o| o.raw_value)
    }

    #[test]
    fn test_all_builtins_resolve() {
        for builtin in BUILTIN_METRICS {
            let metric = builtin_metric(builtin, *builtin).unwrap();
            assert_eq!(metric.name, *builtin);
            assert!(description(builtin).is_some());
        }
        assert!(builtin_metric("nope", "x").is_none());
    }

    #[tokio::test]
    async fn test_item_metrics() {
        let item = DatasetItem::new("capital of France?", "  Paris is the capital ")
            .with_expected("paris");
        let container: Container = item.clone().into();

        let exact = builtin_metric("exact_match", "exact").unwrap();
        assert_eq!(
            measure(&exact, &container, Target::Item(&item)).await.unwrap(),
            RawValue::Bool(false)
        );

        let contains = builtin_metric("contains_expected", "contains").unwrap();
        assert_eq!(
            measure(&contains, &container, Target::Item(&item)).await.unwrap(),
            RawValue::Bool(true)
        );

        let words = builtin_metric("word_count", "words").unwrap();
        assert_eq!(
            measure(&words, &container, Target::Item(&item)).await.unwrap(),
            RawValue::Number(4.0)
        );
    }

    #[tokio::test]
    async fn test_missing_expected_is_producer_error() {
        let item = DatasetItem::new("q", "a");
        let container: Container = item.clone().into();
        let exact = builtin_metric("exact_match", "exact").unwrap();
        let err = measure(&exact, &container, Target::Item(&item)).await.unwrap_err();
        assert!(matches!(err, EvalError::Producer { .. }));
    }

    #[tokio::test]
    async fn test_conversation_metrics() {
        let conversation = Conversation::new(vec![
            ConversationStep::new("hi", "hello")
                .with_tool_call(ToolCall::new("lookup", serde_json::json!({}))),
            ConversationStep::new("weather?", "sunny")
                .with_tool_call(ToolCall::new("get_weather", serde_json::json!({"city": "Paris"}))),
            ConversationStep::new("thanks", "bye"),
        ]);
        let container: Container = conversation.clone().into();

        let steps = builtin_metric("step_count", "steps").unwrap();
        assert_eq!(
            measure(&steps, &container, Target::Conversation(&conversation)).await.unwrap(),
            RawValue::Number(3.0)
        );

        let tools = builtin_metric("tool_names", "tools").unwrap();
        assert_eq!(
            measure(&tools, &container, Target::Conversation(&conversation)).await.unwrap(),
            RawValue::from("get_weather")
        );
    }

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, Score> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Score::new(*v).unwrap()))
            .collect()
    }

    fn input(name: &str, weight: f64) -> ScorerInput {
        ScorerInput::new(Arc::new(builtin_metric("output_length", name).unwrap()))
            .with_weight(weight)
    }

    #[test]
    fn test_weighted_average() {
        let inputs = vec![input("a", 3.0), input("b", 1.0)];
        let combiner = weighted_average(&inputs, true);
        let score = combiner.combine(&scores(&[("a", 1.0), ("b", 0.0)])).unwrap();
        assert_eq!(score.value(), 0.75);

        // Absent inputs drop out of the denominator
        let score = combiner.combine(&scores(&[("b", 0.4)])).unwrap();
        assert!((score.value() - 0.4).abs() < 1e-12);

        let raw = weighted_average(&inputs, false);
        assert!(raw.combine(&scores(&[("a", 1.0), ("b", 1.0)])).is_err());
        let score = raw.combine(&scores(&[("a", 0.2)])).unwrap();
        assert!((score.value() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_minimum() {
        let combiner = minimum();
        let score = combiner.combine(&scores(&[("a", 0.9), ("b", 0.3)])).unwrap();
        assert_eq!(score.value(), 0.3);
        assert!(combiner.combine(&BTreeMap::new()).is_err());
    }
}
