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

//! Normalizers: raw value + calibration context -> [`Score`]
//!
//! Parameters set on the normalizer take precedence over the calibration context.
//! A parameter missing from both is a configuration error. Out-of-range
//! results are errors unless the normalizer asks for clipping.

use crate::calibration::CalibrationContext;
use crate::EvalError;
use evalflow_core::{RawValue, Score, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Which end of the raw scale is better
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Higher,
    Lower,
}

pub type CustomNormalizerFn =
    dyn Fn(&RawValue, &CalibrationContext) -> Result<f64, EvalError> + Send + Sync;

/// Caller-supplied normalizer. Its result is range-checked like any other.
#[derive(Clone)]
pub struct CustomNormalizer(pub Arc<CustomNormalizerFn>);

impl fmt::Debug for CustomNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomNormalizer(<fn>)")
    }
}

impl PartialEq for CustomNormalizer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NormalizerSpec {
    /// Numbers already in `[0, 1]`; booleans map to 1.0 / 0.0
    Identity,

    MinMax {
        min: Option<f64>,
        max: Option<f64>,
        direction: Option<Direction>,
        #[serde(default)]
        clip: bool,
    },

    /// `sigmoid((v - mean) / std_dev)`
    ZScore {
        mean: Option<f64>,
        std_dev: Option<f64>,
        direction: Option<Direction>,
    },

    Threshold {
        threshold: Option<f64>,
        above: Option<f64>,
        below: Option<f64>,
        direction: Option<Direction>,
    },

    /// `slope * v + intercept`
    Linear {
        slope: f64,
        #[serde(default)]
        intercept: f64,
        direction: Option<Direction>,
        #[serde(default)]
        clip: bool,
        clip_range: Option<(f64, f64)>,
    },

    OrdinalMap {
        map: Option<BTreeMap<String, f64>>,
    },

    #[serde(skip)]
    Custom(CustomNormalizer),
}

impl NormalizerSpec {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RawValue, &CalibrationContext) -> Result<f64, EvalError> + Send + Sync + 'static,
    {
        NormalizerSpec::Custom(CustomNormalizer(Arc::new(f)))
    }

    pub fn min_max(min: f64, max: f64) -> Self {
        NormalizerSpec::MinMax {
            min: Some(min),
            max: Some(max),
            direction: None,
            clip: false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NormalizerSpec::Identity => "identity",
            NormalizerSpec::MinMax { .. } => "min-max",
            NormalizerSpec::ZScore { .. } => "z-score",
            NormalizerSpec::Threshold { .. } => "threshold",
            NormalizerSpec::Linear { .. } => "linear",
            NormalizerSpec::OrdinalMap { .. } => "ordinal-map",
            NormalizerSpec::Custom(_) => "custom",
        }
    }

    /// Check the parameters fixed on the normalizer itself
    pub fn validate(&self) -> Result<(), EvalError> {
        match self {
            NormalizerSpec::MinMax {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => Err(EvalError::config(format!(
                "min-max normalizer has min {} greater than max {}",
                min, max
            ))),
            NormalizerSpec::ZScore {
                std_dev: Some(sd), ..
            } if *sd < 0.0 || !sd.is_finite() => Err(EvalError::config(format!(
                "z-score normalizer has invalid std_dev {}",
                sd
            ))),
            NormalizerSpec::Threshold { above, below, .. } => {
                for (label, value) in [("above", above), ("below", below)] {
                    if let Some(v) = value {
                        if !(0.0..=1.0).contains(v) {
                            return Err(EvalError::config(format!(
                                "threshold normalizer '{}' value {} is outside [0, 1]",
                                label, v
                            )));
                        }
                    }
                }
                Ok(())
            }
            NormalizerSpec::Linear {
                clip_range: Some((lo, hi)),
                ..
            } if !(0.0 <= *lo && lo <= hi && *hi <= 1.0) => Err(EvalError::config(format!(
                "linear normalizer clip_range ({}, {}) must satisfy 0 <= lo <= hi <= 1",
                lo, hi
            ))),
            NormalizerSpec::OrdinalMap { map: Some(map) } => {
                match map.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
                    Some((key, v)) => Err(EvalError::config(format!(
                        "ordinal map entry '{}' = {} is outside [0, 1]",
                        key, v
                    ))),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Whether this normalizer can consume values of `value_type`
    pub fn check_compatible(&self, value_type: ValueType) -> Result<(), EvalError> {
        let ok = match self {
            NormalizerSpec::Identity => {
                matches!(value_type, ValueType::Number | ValueType::Boolean)
            }
            NormalizerSpec::MinMax { .. }
            | NormalizerSpec::ZScore { .. }
            | NormalizerSpec::Threshold { .. }
            | NormalizerSpec::Linear { .. } => !matches!(value_type, ValueType::String),
            NormalizerSpec::OrdinalMap { .. } | NormalizerSpec::Custom(_) => true,
        };

        if ok {
            Ok(())
        } else {
            Err(EvalError::config(format!(
                "{} normalizer cannot consume {} values",
                self.kind_name(),
                value_type
            )))
        }
    }
}

/// Map a raw value to a score
pub fn apply(
    raw: &RawValue,
    spec: &NormalizerSpec,
    ctx: &CalibrationContext,
    metric: &str,
) -> Result<Score, EvalError> {
    let score = match spec {
        NormalizerSpec::Identity => match raw {
            RawValue::Bool(b) => Ok(if *b { Score::ONE } else { Score::ZERO }),
            RawValue::Number(v) => Score::new(*v),
            RawValue::String(_) => return Err(wrong_type(raw, spec, metric)),
        },

        NormalizerSpec::MinMax {
            min,
            max,
            direction,
            clip,
        } => {
            let v = numeric(raw, spec, metric)?;
            let min = param(*min, ctx.min, "min", spec, metric)?;
            let max = param(*max, ctx.max, "max", spec, metric)?;
            if min > max {
                return Err(EvalError::config(format!(
                    "min-max normalizer for '{}' resolved min {} greater than max {}",
                    metric, min, max
                )));
            }

            if min == max {
                let preferred = match direction {
                    Some(Direction::Higher) => v > min,
                    Some(Direction::Lower) => v < min,
                    None => false,
                };
                Ok(if preferred { Score::ONE } else { Score::HALF })
            } else {
                let mut x = (v - min) / (max - min);
                if *direction == Some(Direction::Lower) {
                    x = 1.0 - x;
                }
                bounded(x, *clip)
            }
        }

        NormalizerSpec::ZScore {
            mean,
            std_dev,
            direction,
        } => {
            let v = numeric(raw, spec, metric)?;
            let mean = param(*mean, ctx.mean, "mean", spec, metric)?;
            let std_dev = param(*std_dev, ctx.std_dev, "std_dev", spec, metric)?;
            if std_dev < 0.0 {
                return Err(EvalError::config(format!(
                    "z-score normalizer for '{}' resolved negative std_dev {}",
                    metric, std_dev
                )));
            }

            if std_dev == 0.0 {
                Ok(Score::HALF)
            } else {
                let mut z = (v - mean) / std_dev;
                if *direction == Some(Direction::Lower) {
                    z = -z;
                }
                Score::new(sigmoid(z))
            }
        }

        NormalizerSpec::Threshold {
            threshold,
            above,
            below,
            direction,
        } => {
            let v = numeric(raw, spec, metric)?;
            let threshold = param(*threshold, ctx.threshold, "threshold", spec, metric)?;
            let passed = match direction.unwrap_or_default() {
                Direction::Higher => v >= threshold,
                Direction::Lower => v <= threshold,
            };
            if passed {
                Score::new(above.unwrap_or(1.0))
            } else {
                Score::new(below.unwrap_or(0.0))
            }
        }

        NormalizerSpec::Linear {
            slope,
            intercept,
            direction,
            clip,
            clip_range,
        } => {
            let v = numeric(raw, spec, metric)?;
            let mut y = slope * v + intercept;
            if *direction == Some(Direction::Lower) {
                y = 1.0 - y;
            }
            if *clip {
                let (lo, hi) = clip_range.unwrap_or((0.0, 1.0));
                if y.is_nan() {
                    Score::new(y)
                } else {
                    Score::new(y.clamp(lo, hi))
                }
            } else {
                Score::new(y)
            }
        }

        NormalizerSpec::OrdinalMap { map } => {
            let map = map.as_ref().or(ctx.map.as_ref()).ok_or_else(|| {
                EvalError::config(format!(
                    "ordinal-map normalizer for '{}' has no map in its settings or calibration",
                    metric
                ))
            })?;
            let key = raw.category_key();
            match map.get(&key) {
                Some(v) => Score::new(*v),
                None => {
                    return Err(EvalError::data(format!(
                        "metric '{}' value '{}' is not in the ordinal map (available: {})",
                        metric,
                        key,
                        map.keys().cloned().collect::<Vec<_>>().join(", ")
                    )))
                }
            }
        }

        NormalizerSpec::Custom(CustomNormalizer(f)) => Score::new(f(raw, ctx)?),
    };

    score.map_err(|e| {
        EvalError::data(format!(
            "{} normalizer for metric '{}' on value {}: {}",
            spec.kind_name(),
            metric,
            raw,
            e
        ))
    })
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn bounded(x: f64, clip: bool) -> Result<Score, evalflow_core::ScoreError> {
    if clip {
        Score::clamped(x)
    } else {
        Score::new(x)
    }
}

fn numeric(raw: &RawValue, spec: &NormalizerSpec, metric: &str) -> Result<f64, EvalError> {
    raw.as_numeric().ok_or_else(|| wrong_type(raw, spec, metric))
}

fn wrong_type(raw: &RawValue, spec: &NormalizerSpec, metric: &str) -> EvalError {
    EvalError::data(format!(
        "{} normalizer for metric '{}' cannot consume {} value {}",
        spec.kind_name(),
        metric,
        raw.kind_name(),
        raw
    ))
}

fn param(
    from_spec: Option<f64>,
    from_ctx: Option<f64>,
    name: &str,
    spec: &NormalizerSpec,
    metric: &str,
) -> Result<f64, EvalError> {
    from_spec.or(from_ctx).ok_or_else(|| {
        EvalError::config(format!(
            "{} normalizer for metric '{}' is missing '{}' in both its settings and calibration",
            spec.kind_name(),
            metric,
            name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(raw: impl Into<RawValue>, spec: &NormalizerSpec) -> Result<Score, EvalError> {
        apply(&raw.into(), spec, &CalibrationContext::empty(), "m")
    }

    fn value(raw: impl Into<RawValue>, spec: &NormalizerSpec) -> f64 {
        run(raw, spec).unwrap().value()
    }

    #[test]
    fn test_identity() {
        assert_eq!(value(0.3, &NormalizerSpec::Identity), 0.3);
        assert_eq!(value(true, &NormalizerSpec::Identity), 1.0);
        assert_eq!(value(false, &NormalizerSpec::Identity), 0.0);
        assert!(matches!(run(1.2, &NormalizerSpec::Identity), Err(EvalError::Data(_))));
        assert!(matches!(run("x", &NormalizerSpec::Identity), Err(EvalError::Data(_))));
    }

    #[test]
    fn test_min_max_boundaries() {
        let spec = NormalizerSpec::min_max(0.0, 10.0);
        assert_eq!(value(0.0, &spec), 0.0);
        assert_eq!(value(10.0, &spec), 1.0);
        assert_eq!(value(5.0, &spec), 0.5);
        assert!(run(11.0, &spec).is_err());
    }

    #[test]
    fn test_min_max_lower_and_clip() {
        let spec = NormalizerSpec::MinMax {
            min: Some(0.0),
            max: Some(10.0),
            direction: Some(Direction::Lower),
            clip: true,
        };
        assert_eq!(value(2.0, &spec), 0.8);
        assert_eq!(value(-5.0, &spec), 1.0);
        assert_eq!(value(50.0, &spec), 0.0);
    }

    #[test]
    fn test_min_max_degenerate() {
        assert_eq!(value(3.0, &NormalizerSpec::min_max(3.0, 3.0)), 0.5);
        assert_eq!(value(7.0, &NormalizerSpec::min_max(3.0, 3.0)), 0.5);

        let higher = NormalizerSpec::MinMax {
            min: Some(3.0),
            max: Some(3.0),
            direction: Some(Direction::Higher),
            clip: false,
        };
        assert_eq!(value(4.0, &higher), 1.0);
        assert_eq!(value(3.0, &higher), 0.5);
        assert_eq!(value(2.0, &higher), 0.5);
    }

    #[test]
    fn test_min_max_uses_context_and_spec_wins() {
        let spec = NormalizerSpec::MinMax {
            min: None,
            max: Some(20.0),
            direction: None,
            clip: false,
        };
        let ctx = CalibrationContext::with_range(10.0, 100.0);
        let score = apply(&RawValue::Number(15.0), &spec, &ctx, "m").unwrap();
        assert_eq!(score.value(), 0.5);

        let err = run(15.0, &spec).unwrap_err();
        assert!(matches!(err, EvalError::Config(ref msg) if msg.contains("'min'")));
    }

    #[test]
    fn test_z_score() {
        let spec = NormalizerSpec::ZScore {
            mean: Some(10.0),
            std_dev: Some(2.0),
            direction: None,
        };
        assert_eq!(value(10.0, &spec), 0.5);
        assert!(value(14.0, &spec) > 0.88);

        let lower = NormalizerSpec::ZScore {
            mean: Some(10.0),
            std_dev: Some(2.0),
            direction: Some(Direction::Lower),
        };
        let sum = value(14.0, &spec) + value(14.0, &lower);
        assert!((sum - 1.0).abs() < 1e-12);

        let flat = NormalizerSpec::ZScore {
            mean: Some(1.0),
            std_dev: Some(0.0),
            direction: None,
        };
        assert_eq!(value(100.0, &flat), 0.5);
    }

    #[test]
    fn test_threshold() {
        let spec = NormalizerSpec::Threshold {
            threshold: Some(0.7),
            above: None,
            below: Some(0.2),
            direction: None,
        };
        assert_eq!(value(0.7, &spec), 1.0);
        assert_eq!(value(0.69, &spec), 0.2);

        let lower = NormalizerSpec::Threshold {
            threshold: Some(100.0),
            above: None,
            below: None,
            direction: Some(Direction::Lower),
        };
        assert_eq!(value(100.0, &lower), 1.0);
        assert_eq!(value(101.0, &lower), 0.0);
    }

    #[test]
    fn test_linear() {
        let spec = NormalizerSpec::Linear {
            slope: 0.1,
            intercept: 0.0,
            direction: None,
            clip: false,
            clip_range: None,
        };
        assert!((value(5.0, &spec) - 0.5).abs() < 1e-12);
        assert!(run(20.0, &spec).is_err());

        let clipped = NormalizerSpec::Linear {
            slope: 0.1,
            intercept: 0.0,
            direction: None,
            clip: true,
            clip_range: Some((0.2, 0.8)),
        };
        assert_eq!(value(20.0, &clipped), 0.8);
        assert_eq!(value(0.0, &clipped), 0.2);
    }

    #[test]
    fn test_ordinal_map() {
        let map = BTreeMap::from([
            ("low".to_string(), 0.0),
            ("mid".to_string(), 0.5),
            ("3".to_string(), 1.0),
        ]);
        let spec = NormalizerSpec::OrdinalMap { map: Some(map) };
        assert_eq!(value("mid", &spec), 0.5);
        assert_eq!(value(3.0, &spec), 1.0);

        let err = run("high", &spec).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("high") && msg.contains("low") && msg.contains("mid"));
    }

    #[test]
    fn test_custom_result_validated() {
        let spec = NormalizerSpec::custom(|raw, _| Ok(raw.as_numeric().unwrap_or(0.0) * 2.0));
        assert_eq!(value(0.25, &spec), 0.5);
        assert!(matches!(run(0.75, &spec), Err(EvalError::Data(_))));
    }

    #[test]
    fn test_validate_and_compatibility() {
        let bad = NormalizerSpec::Threshold {
            threshold: Some(1.0),
            above: Some(1.5),
            below: None,
            direction: None,
        };
        assert!(matches!(bad.validate(), Err(EvalError::Config(_))));
        assert!(NormalizerSpec::min_max(0.0, 1.0).validate().is_ok());
        assert!(NormalizerSpec::min_max(2.0, 1.0).validate().is_err());

        assert!(NormalizerSpec::Identity
            .check_compatible(ValueType::String)
            .is_err());
        assert!(NormalizerSpec::OrdinalMap { map: None }
            .check_compatible(ValueType::String)
            .is_ok());
    }

    #[test]
    fn test_deserialize_tagged_normalizer() {
        let spec: NormalizerSpec =
            serde_json::from_str(r#"{"type": "min-max", "min": 0, "max": 5, "direction": "lower"}"#)
                .unwrap();
        assert!(matches!(
            spec,
            NormalizerSpec::MinMax {
                direction: Some(Direction::Lower),
                clip: false,
                ..
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_clipped_min_max_always_in_bounds(
            v in -1e6f64..1e6f64,
            lo in -100.0f64..0.0,
            span in 0.1f64..100.0,
        ) {
            let spec = NormalizerSpec::MinMax {
                min: Some(lo),
                max: Some(lo + span),
                direction: None,
                clip: true,
            };
            let empty = CalibrationContext::empty();
            let score = apply(&RawValue::Number(v), &spec, &empty, "m").unwrap();
            prop_assert!((0.0..=1.0).contains(&score.value()));
        }

        #[test]
        fn prop_unclipped_min_max_errors_outside_range(v in 10.001f64..1e6f64) {
            let spec = NormalizerSpec::min_max(0.0, 10.0);
            let empty = CalibrationContext::empty();
            prop_assert!(apply(&RawValue::Number(v), &spec, &empty, "m").is_err());
        }

        #[test]
        fn prop_z_score_always_in_bounds(
            v in -1e3f64..1e3f64,
            mean in -10.0f64..10.0,
            sd in 0.01f64..10.0,
        ) {
            let spec = NormalizerSpec::ZScore {
                mean: Some(mean),
                std_dev: Some(sd),
                direction: None,
            };
            let empty = CalibrationContext::empty();
            let score = apply(&RawValue::Number(v), &spec, &empty, "m").unwrap();
            prop_assert!((0.0..=1.0).contains(&score.value()));
        }
    }
}
