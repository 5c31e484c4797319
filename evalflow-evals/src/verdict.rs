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

//! Pass/fail policies

use crate::EvalError;
use evalflow_core::{RawValue, Score, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("pass"),
            Verdict::Fail => f.write_str("fail"),
            Verdict::Unknown => f.write_str("unknown"),
        }
    }
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        if passed {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

pub type CustomVerdictFn = dyn Fn(Option<Score>, Option<&RawValue>) -> Verdict + Send + Sync;

#[derive(Clone)]
pub struct CustomVerdict(pub Arc<CustomVerdictFn>);

impl fmt::Debug for CustomVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomVerdict(<fn>)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VerdictPolicy {
    #[default]
    None,

    Boolean {
        pass_when: bool,
    },

    /// Pass when the raw value is at least `pass_at`
    NumberThreshold {
        pass_at: f64,
    },

    /// Inclusive range; bounds default to 0 and 1
    NumberRange {
        min: Option<f64>,
        max: Option<f64>,
    },

    Ordinal {
        pass_when_in: Vec<String>,
    },

    #[serde(skip)]
    Custom(CustomVerdict),
}

impl VerdictPolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Option<Score>, Option<&RawValue>) -> Verdict + Send + Sync + 'static,
    {
        VerdictPolicy::Custom(CustomVerdict(Arc::new(f)))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VerdictPolicy::None => "none",
            VerdictPolicy::Boolean { .. } => "boolean",
            VerdictPolicy::NumberThreshold { .. } => "number-threshold",
            VerdictPolicy::NumberRange { .. } => "number-range",
            VerdictPolicy::Ordinal { .. } => "ordinal",
            VerdictPolicy::Custom(_) => "custom",
        }
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        match self {
            VerdictPolicy::NumberThreshold { pass_at } if !pass_at.is_finite() => Err(
                EvalError::config(format!("number-threshold pass_at {} is not finite", pass_at)),
            ),
            VerdictPolicy::NumberRange { min, max } => {
                let (lo, hi) = (min.unwrap_or(0.0), max.unwrap_or(1.0));
                if lo > hi {
                    Err(EvalError::config(format!(
                        "number-range min {} is greater than max {}",
                        lo, hi
                    )))
                } else {
                    Ok(())
                }
            }
            VerdictPolicy::Ordinal { pass_when_in } if pass_when_in.is_empty() => Err(
                EvalError::config("ordinal verdict needs at least one passing value"),
            ),
            _ => Ok(()),
        }
    }

    pub fn check_compatible(&self, value_type: ValueType) -> Result<(), EvalError> {
        let ok = match self {
            VerdictPolicy::None | VerdictPolicy::Custom(_) => true,
            VerdictPolicy::Boolean { .. } => value_type == ValueType::Boolean,
            VerdictPolicy::NumberThreshold { .. } | VerdictPolicy::NumberRange { .. } => {
                value_type == ValueType::Number
            }
            VerdictPolicy::Ordinal { .. } => {
                matches!(value_type, ValueType::Ordinal | ValueType::String)
            }
        };

        if ok {
            Ok(())
        } else {
            Err(EvalError::config(format!(
                "{} verdict is not compatible with {} values",
                self.kind_name(),
                value_type
            )))
        }
    }
}

/// Decide one row. Absent or wrongly shaped values give `Unknown`.
pub fn evaluate(score: Option<Score>, raw: Option<&RawValue>, policy: &VerdictPolicy) -> Verdict {
    match policy {
        VerdictPolicy::None => Verdict::Unknown,
        VerdictPolicy::Boolean { pass_when } => match raw.and_then(RawValue::as_bool) {
            Some(b) => (b == *pass_when).into(),
            None => Verdict::Unknown,
        },
        VerdictPolicy::NumberThreshold { pass_at } => match raw.and_then(RawValue::as_f64) {
            Some(v) => (v >= *pass_at).into(),
            None => Verdict::Unknown,
        },
        VerdictPolicy::NumberRange { min, max } => match raw.and_then(RawValue::as_f64) {
            Some(v) => (min.unwrap_or(0.0) <= v && v <= max.unwrap_or(1.0)).into(),
            None => Verdict::Unknown,
        },
        VerdictPolicy::Ordinal { pass_when_in } => match raw {
            Some(value @ (RawValue::String(_) | RawValue::Number(_))) => {
                pass_when_in.contains(&value.category_key()).into()
            }
            _ => Verdict::Unknown,
        },
        VerdictPolicy::Custom(CustomVerdict(f)) => f(score, raw),
    }
}
