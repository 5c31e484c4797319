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

//! Evals: what a run reports on

use crate::aggregator::AggregatorDef;
use crate::metric::{MetricDefinition, MetricScope};
use crate::scorer::Scorer;
use crate::verdict::VerdictPolicy;
use crate::EvalError;
use evalflow_core::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalKind {
    SingleTurn,
    MultiTurn,
    Scorer,
}

impl fmt::Display for EvalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalKind::SingleTurn => f.write_str("single_turn"),
            EvalKind::MultiTurn => f.write_str("multi_turn"),
            EvalKind::Scorer => f.write_str("scorer"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Eval {
    /// Single-scope metric judged per step or item
    SingleTurn {
        name: String,
        metric: Arc<MetricDefinition>,
        verdict: VerdictPolicy,
    },
    /// Multi-scope metric judged per container
    MultiTurn {
        name: String,
        metric: Arc<MetricDefinition>,
        verdict: VerdictPolicy,
    },
    /// Derived score judged per scorer row
    Scorer {
        name: String,
        scorer: Arc<Scorer>,
        verdict: VerdictPolicy,
    },
}

impl Eval {
    pub fn single_turn(name: impl Into<String>, metric: Arc<MetricDefinition>) -> Self {
        Eval::SingleTurn {
            name: name.into(),
            metric,
            verdict: VerdictPolicy::None,
        }
    }

    pub fn multi_turn(name: impl Into<String>, metric: Arc<MetricDefinition>) -> Self {
        Eval::MultiTurn {
            name: name.into(),
            metric,
            verdict: VerdictPolicy::None,
        }
    }

    pub fn scorer(name: impl Into<String>, scorer: Arc<Scorer>) -> Self {
        Eval::Scorer {
            name: name.into(),
            scorer,
            verdict: VerdictPolicy::None,
        }
    }

    pub fn with_verdict(mut self, policy: VerdictPolicy) -> Self {
        match &mut self {
            Eval::SingleTurn { verdict, .. }
            | Eval::MultiTurn { verdict, .. }
            | Eval::Scorer { verdict, .. } => *verdict = policy,
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Eval::SingleTurn { name, .. }
            | Eval::MultiTurn { name, .. }
            | Eval::Scorer { name, .. } => name,
        }
    }

    pub fn kind(&self) -> EvalKind {
        match self {
            Eval::SingleTurn { .. } => EvalKind::SingleTurn,
            Eval::MultiTurn { .. } => EvalKind::MultiTurn,
            Eval::Scorer { .. } => EvalKind::Scorer,
        }
    }

    pub fn verdict(&self) -> &VerdictPolicy {
        match self {
            Eval::SingleTurn { verdict, .. }
            | Eval::MultiTurn { verdict, .. }
            | Eval::Scorer { verdict, .. } => verdict,
        }
    }

    /// Metrics this eval needs measured
    pub fn metrics(&self) -> Vec<&Arc<MetricDefinition>> {
        match self {
            Eval::SingleTurn { metric, .. } | Eval::MultiTurn { metric, .. } => vec![metric],
            Eval::Scorer { scorer, .. } => {
                scorer.inputs.iter().map(|input| &input.metric).collect()
            }
        }
    }

    pub fn aggregators(&self) -> &[AggregatorDef] {
        match self {
            Eval::SingleTurn { metric, .. } | Eval::MultiTurn { metric, .. } => &metric.aggregators,
            Eval::Scorer { scorer, .. } => &scorer.output.aggregators,
        }
    }

    /// Value type of the rows this eval reports; scorer rows are numbers
    pub fn output_value_type(&self) -> ValueType {
        match self {
            Eval::SingleTurn { metric, .. } | Eval::MultiTurn { metric, .. } => metric.value_type,
            Eval::Scorer { .. } => ValueType::Number,
        }
    }

    /// Whether numeric aggregators consume scores rather than raw numbers
    pub fn aggregates_scores(&self) -> bool {
        match self {
            Eval::SingleTurn { metric, .. } | Eval::MultiTurn { metric, .. } => {
                metric.normalization.is_some()
            }
            Eval::Scorer { .. } => true,
        }
    }

    /// Configuration checks that do not need any data
    pub fn validate(&self) -> Result<(), EvalError> {
        let context = |e: EvalError| match e {
            EvalError::Config(msg) => EvalError::config(format!("eval '{}': {}", self.name(), msg)),
            other => other,
        };

        match self {
            Eval::SingleTurn { metric, .. } => {
                expect_scope(metric, MetricScope::Single).map_err(context)?;
                validate_metric(metric).map_err(context)?;
            }
            Eval::MultiTurn { metric, .. } => {
                expect_scope(metric, MetricScope::Multi).map_err(context)?;
                validate_metric(metric).map_err(context)?;
            }
            Eval::Scorer { scorer, .. } => {
                scorer.validate().map_err(context)?;
                for input in &scorer.inputs {
                    validate_metric(&input.metric).map_err(context)?;
                }
            }
        }

        let value_type = self.output_value_type();
        self.verdict().validate().map_err(context)?;
        self.verdict()
            .check_compatible(value_type)
            .map_err(context)?;

        for aggregator in self.aggregators() {
            aggregator.validate().map_err(context)?;
            aggregator.check_compatible(value_type).map_err(context)?;
            if matches!(aggregator, AggregatorDef::Numeric(_))
                && value_type == ValueType::Ordinal
                && !self.aggregates_scores()
            {
                return Err(context(EvalError::config(format!(
                    "numeric aggregator '{}' on an ordinal metric needs a normalizer",
                    aggregator.label()
                ))));
            }
        }

        Ok(())
    }
}

fn expect_scope(metric: &MetricDefinition, scope: MetricScope) -> Result<(), EvalError> {
    if metric.scope == scope {
        Ok(())
    } else {
        Err(EvalError::config(format!(
            "metric '{}' has {} scope, expected {}",
            metric.name, metric.scope, scope
        )))
    }
}

fn validate_metric(metric: &MetricDefinition) -> Result<(), EvalError> {
    if metric.name.is_empty() {
        return Err(EvalError::config("metric name must not be empty"));
    }
    if let Some(config) = &metric.normalization {
        config.normalizer.validate()?;
        config.normalizer.check_compatible(metric.value_type)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{CategoricalAggregator, NumericAggregator};
    use crate::calibration::NormalizationConfig;
    use crate::normalizer::NormalizerSpec;
    use evalflow_core::RawValue;

    fn metric(value_type: ValueType, scope: MetricScope) -> MetricDefinition {
        MetricDefinition::code("m", value_type, scope, |_, _| Ok(RawValue::Bool(true)))
    }

    #[test]
    fn test_scope_mismatch_rejected() {
        let eval = Eval::single_turn("e", Arc::new(metric(ValueType::Number, MetricScope::Multi)));
        let err = eval.validate().unwrap_err();
        assert!(err.to_string().contains("eval 'e'"));

        let eval = Eval::multi_turn("e", Arc::new(metric(ValueType::Number, MetricScope::Multi)));
        assert!(eval.validate().is_ok());
    }

    #[test]
    fn test_incompatible_verdict_rejected() {
        let eval = Eval::single_turn("e", Arc::new(metric(ValueType::String, MetricScope::Single)))
            .with_verdict(VerdictPolicy::NumberThreshold { pass_at: 0.5 });
        assert!(matches!(eval.validate(), Err(EvalError::Config(_))));
    }

    #[test]
    fn test_incompatible_aggregator_rejected() {
        let m = metric(ValueType::Number, MetricScope::Single)
            .with_aggregator(AggregatorDef::Categorical(CategoricalAggregator::Counts));
        assert!(Eval::single_turn("e", Arc::new(m)).validate().is_err());

        let m = metric(ValueType::Number, MetricScope::Single)
            .with_aggregator(AggregatorDef::Numeric(NumericAggregator::Percentile { p: 150.0 }));
        assert!(Eval::single_turn("e", Arc::new(m)).validate().is_err());
    }

    #[test]
    fn test_numeric_aggregator_on_ordinal_needs_normalizer() {
        let m = metric(ValueType::Ordinal, MetricScope::Single)
            .with_aggregator(AggregatorDef::Numeric(NumericAggregator::Mean));
        assert!(Eval::single_turn("e", Arc::new(m.clone())).validate().is_err());

        let m = m.with_normalization(NormalizationConfig::new(NormalizerSpec::OrdinalMap {
            map: None,
        }));
        let eval = Eval::single_turn("e", Arc::new(m));
        assert!(eval.aggregates_scores());
        assert!(eval.validate().is_ok());
    }

    #[test]
    fn test_incompatible_normalizer_rejected() {
        let m = metric(ValueType::String, MetricScope::Single)
            .with_normalization(NormalizationConfig::new(NormalizerSpec::Identity));
        assert!(Eval::single_turn("e", Arc::new(m)).validate().is_err());
    }
}
