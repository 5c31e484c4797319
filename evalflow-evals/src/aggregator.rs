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

//! Statistical rollups over scores and raw values

use crate::EvalError;
use evalflow_core::ValueType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_pass_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NumericAggregator {
    Mean,
    Median,
    /// Linear interpolation at `p / 100 * (n - 1)`
    Percentile {
        p: f64,
    },
    Min,
    Max,
    /// Share of values `>= threshold`
    PassRate {
        #[serde(default = "default_pass_threshold")]
        threshold: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BooleanAggregator {
    TrueRate,
    FalseRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CategoricalAggregator {
    Counts,
    Proportions,
    /// Every value sharing the highest count, sorted
    Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "op", rename_all = "snake_case")]
pub enum AggregatorDef {
    Numeric(NumericAggregator),
    Boolean(BooleanAggregator),
    Categorical(CategoricalAggregator),
}

/// Values handed to an aggregator
#[derive(Debug, Clone, Copy)]
pub enum AggregationInput<'a> {
    /// Normalized scores; must be finite and within `[0, 1]`
    Scores(&'a [f64]),
    /// Raw numbers; unconstrained
    Numbers(&'a [f64]),
    Booleans(&'a [bool]),
    /// Category keys
    Categories(&'a [String]),
}

impl AggregationInput<'_> {
    pub fn len(&self) -> usize {
        match self {
            AggregationInput::Scores(v) | AggregationInput::Numbers(v) => v.len(),
            AggregationInput::Booleans(v) => v.len(),
            AggregationInput::Categories(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind_name(&self) -> &'static str {
        match self {
            AggregationInput::Scores(_) => "scores",
            AggregationInput::Numbers(_) => "numbers",
            AggregationInput::Booleans(_) => "booleans",
            AggregationInput::Categories(_) => "categories",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateValue {
    Number(f64),
    Counts(BTreeMap<String, usize>),
    Proportions(BTreeMap<String, f64>),
    Modes(Vec<String>),
}

impl AggregateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AggregateValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub aggregator: String,
    pub sample_count: usize,
    pub value: AggregateValue,
}

impl NumericAggregator {
    pub fn label(&self) -> String {
        match self {
            NumericAggregator::Mean => "mean".to_string(),
            NumericAggregator::Median => "median".to_string(),
            NumericAggregator::Percentile { p } => format!("p{}", p),
            NumericAggregator::Min => "min".to_string(),
            NumericAggregator::Max => "max".to_string(),
            NumericAggregator::PassRate { threshold } => format!("pass_rate@{}", threshold),
        }
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        match self {
            NumericAggregator::Percentile { p } if !(0.0..=100.0).contains(p) => Err(
                EvalError::config(format!("percentile {} is outside [0, 100]", p)),
            ),
            NumericAggregator::PassRate { threshold } if !threshold.is_finite() => Err(
                EvalError::config(format!("pass-rate threshold {} is not finite", threshold)),
            ),
            _ => Ok(()),
        }
    }

    pub fn apply(&self, values: &[f64]) -> Result<f64, EvalError> {
        self.validate()?;
        if values.is_empty() {
            return Err(EvalError::data(format!(
                "cannot compute {} of an empty input",
                self.label()
            )));
        }

        let result = match self {
            NumericAggregator::Mean => mean(values),
            NumericAggregator::Median => percentile(values, 50.0),
            NumericAggregator::Percentile { p } => percentile(values, *p),
            NumericAggregator::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            NumericAggregator::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            NumericAggregator::PassRate { threshold } => {
                values.iter().filter(|&&v| v >= *threshold).count() as f64 / values.len() as f64
            }
        };
        Ok(result)
    }
}

/// Running mean; a constant input yields that constant exactly
fn mean(values: &[f64]) -> f64 {
    let mut m = values[0];
    for (i, v) in values.iter().enumerate().skip(1) {
        m += (v - m) / (i + 1) as f64;
    }
    m
}

fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let index = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let fraction = index - lower as f64;
        sorted[lower] + fraction * (sorted[upper] - sorted[lower])
    }
}

impl BooleanAggregator {
    pub fn label(&self) -> &'static str {
        match self {
            BooleanAggregator::TrueRate => "true_rate",
            BooleanAggregator::FalseRate => "false_rate",
        }
    }

    pub fn apply(&self, values: &[bool]) -> Result<f64, EvalError> {
        if values.is_empty() {
            return Err(EvalError::data(format!(
                "cannot compute {} of an empty input",
                self.label()
            )));
        }
        let trues = values.iter().filter(|&&b| b).count() as f64;
        let n = values.len() as f64;
        Ok(match self {
            BooleanAggregator::TrueRate => trues / n,
            BooleanAggregator::FalseRate => (n - trues) / n,
        })
    }
}

impl CategoricalAggregator {
    pub fn label(&self) -> &'static str {
        match self {
            CategoricalAggregator::Counts => "counts",
            CategoricalAggregator::Proportions => "proportions",
            CategoricalAggregator::Mode => "mode",
        }
    }

    pub fn apply(&self, values: &[String]) -> Result<AggregateValue, EvalError> {
        if values.is_empty() {
            return Err(EvalError::data(format!(
                "cannot compute {} of an empty input",
                self.label()
            )));
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for value in values {
            *counts.entry(value.clone()).or_default() += 1;
        }

        Ok(match self {
            CategoricalAggregator::Counts => AggregateValue::Counts(counts),
            CategoricalAggregator::Proportions => {
                let n = values.len() as f64;
                AggregateValue::Proportions(
                    counts
                        .into_iter()
                        .map(|(k, c)| (k, c as f64 / n))
                        .collect(),
                )
            }
            CategoricalAggregator::Mode => {
                let top = counts.values().copied().max().unwrap_or(0);
                AggregateValue::Modes(
                    counts
                        .into_iter()
                        .filter(|(_, c)| *c == top)
                        .map(|(k, _)| k)
                        .collect(),
                )
            }
        })
    }
}

impl AggregatorDef {
    pub fn label(&self) -> String {
        match self {
            AggregatorDef::Numeric(op) => op.label(),
            AggregatorDef::Boolean(op) => op.label().to_string(),
            AggregatorDef::Categorical(op) => op.label().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        match self {
            AggregatorDef::Numeric(op) => op.validate(),
            _ => Ok(()),
        }
    }

    /// Value types each aggregator kind accepts
    pub fn check_compatible(&self, value_type: ValueType) -> Result<(), EvalError> {
        let ok = match self {
            AggregatorDef::Numeric(_) => matches!(
                value_type,
                ValueType::Number | ValueType::Boolean | ValueType::Ordinal
            ),
            AggregatorDef::Boolean(_) => value_type == ValueType::Boolean,
            AggregatorDef::Categorical(_) => {
                matches!(value_type, ValueType::String | ValueType::Ordinal)
            }
        };

        if ok {
            Ok(())
        } else {
            Err(EvalError::config(format!(
                "aggregator '{}' is not compatible with {} values",
                self.label(),
                value_type
            )))
        }
    }

    pub fn aggregate(&self, input: AggregationInput<'_>) -> Result<AggregateSummary, EvalError> {
        let value = match (self, input) {
            (AggregatorDef::Numeric(op), AggregationInput::Scores(values)) => {
                if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                    return Err(EvalError::data(format!(
                        "aggregator '{}' received score {} outside [0, 1]",
                        op.label(),
                        bad
                    )));
                }
                AggregateValue::Number(op.apply(values)?)
            }
            (AggregatorDef::Numeric(op), AggregationInput::Numbers(values)) => {
                AggregateValue::Number(op.apply(values)?)
            }
            (AggregatorDef::Boolean(op), AggregationInput::Booleans(values)) => {
                AggregateValue::Number(op.apply(values)?)
            }
            (AggregatorDef::Categorical(op), AggregationInput::Categories(values)) => {
                op.apply(values)?
            }
            (def, input) => {
                return Err(EvalError::config(format!(
                    "aggregator '{}' cannot consume {}",
                    def.label(),
                    input.kind_name()
                )))
            }
        };

        Ok(AggregateSummary {
            aggregator: self.label(),
            sample_count: input.len(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_to_ten() -> Vec<f64> {
        (1..=10).map(|v| v as f64).collect()
    }

    #[test]
    fn test_percentile_interpolation() {
        let values = one_to_ten();
        let at = |p: f64| NumericAggregator::Percentile { p }.apply(&values).unwrap();
        assert_eq!(at(0.0), 1.0);
        assert!((at(25.0) - 3.25).abs() < 1e-12);
        assert!((at(50.0) - 5.5).abs() < 1e-12);
        assert!((at(75.0) - 7.75).abs() < 1e-12);
        assert_eq!(at(100.0), 10.0);
        assert_eq!(NumericAggregator::Median.apply(&values).unwrap(), 5.5);
    }

    #[test]
    fn test_mean_of_repeated_value_is_exact() {
        let values = vec![0.1; 1000];
        assert_eq!(NumericAggregator::Mean.apply(&values).unwrap(), 0.1);
        assert_eq!(NumericAggregator::Mean.apply(&one_to_ten()).unwrap(), 5.5);
    }

    #[test]
    fn test_pass_rate() {
        let values = [0.3, 0.5, 0.6, 0.4, 0.9];
        let rate = NumericAggregator::PassRate { threshold: 0.5 }
            .apply(&values)
            .unwrap();
        assert!((rate - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input_is_data_error() {
        assert!(matches!(
            NumericAggregator::Mean.apply(&[]),
            Err(EvalError::Data(_))
        ));
        assert!(BooleanAggregator::TrueRate.apply(&[]).is_err());
        assert!(CategoricalAggregator::Counts.apply(&[]).is_err());
    }

    #[test]
    fn test_invalid_percentile_is_config_error() {
        assert!(matches!(
            NumericAggregator::Percentile { p: 101.0 }.validate(),
            Err(EvalError::Config(_))
        ));
    }

    #[test]
    fn test_boolean_rates() {
        let values = [true, false, true, true];
        assert_eq!(BooleanAggregator::TrueRate.apply(&values).unwrap(), 0.75);
        assert_eq!(BooleanAggregator::FalseRate.apply(&values).unwrap(), 0.25);
    }

    #[test]
    fn test_categorical() {
        let values: Vec<String> = ["b", "a", "b", "a", "c"].iter().map(|s| s.to_string()).collect();

        let counts = CategoricalAggregator::Counts.apply(&values).unwrap();
        assert_eq!(
            counts,
            AggregateValue::Counts(BTreeMap::from([
                ("a".to_string(), 2),
                ("b".to_string(), 2),
                ("c".to_string(), 1),
            ]))
        );

        let mode = CategoricalAggregator::Mode.apply(&values).unwrap();
        assert_eq!(mode, AggregateValue::Modes(vec!["a".to_string(), "b".to_string()]));

        let proportions = CategoricalAggregator::Proportions.apply(&values).unwrap();
        let AggregateValue::Proportions(p) = proportions else {
            panic!("expected proportions");
        };
        assert_eq!(p["c"], 0.2);
    }

    #[test]
    fn test_scores_must_be_in_unit_interval() {
        let def = AggregatorDef::Numeric(NumericAggregator::Mean);
        assert!(matches!(
            def.aggregate(AggregationInput::Scores(&[0.5, 1.5])),
            Err(EvalError::Data(_))
        ));
        let summary = def.aggregate(AggregationInput::Numbers(&[0.5, 1.5])).unwrap();
        assert_eq!(summary.value, AggregateValue::Number(1.0));
        assert_eq!(summary.sample_count, 2);
    }

    #[test]
    fn test_compatibility() {
        let categorical = AggregatorDef::Categorical(CategoricalAggregator::Mode);
        assert!(categorical.check_compatible(ValueType::Number).is_err());
        assert!(categorical.check_compatible(ValueType::Ordinal).is_ok());
        let boolean = AggregatorDef::Boolean(BooleanAggregator::TrueRate);
        assert!(boolean.check_compatible(ValueType::String).is_err());
    }

    #[test]
    fn test_deserialize_definition() {
        let def: AggregatorDef =
            serde_json::from_str(r#"{"kind": "numeric", "op": {"type": "percentile", "p": 95}}"#)
                .unwrap();
        assert_eq!(def, AggregatorDef::Numeric(NumericAggregator::Percentile { p: 95.0 }));

        let def: AggregatorDef =
            serde_json::from_str(r#"{"kind": "numeric", "op": {"type": "pass_rate"}}"#).unwrap();
        assert_eq!(label_of(&def), "pass_rate@0.5");
    }

    fn label_of(def: &AggregatorDef) -> String {
        def.label()
    }
}
