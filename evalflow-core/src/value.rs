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

//! Raw metric values and their declared value domains

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value domain a metric declares for its raw output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Boolean,
    String,
    /// Ordered categories, expressed either as labels or as integral levels
    Ordinal,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
            ValueType::Ordinal => "ordinal",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unnormalized output of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl RawValue {
    /// Numeric payload, without coercion
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view where booleans count as 1.0 / 0.0
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) => Some(*v),
            RawValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            RawValue::String(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            RawValue::Bool(_) => "boolean",
            RawValue::Number(_) => "number",
            RawValue::String(_) => "string",
        }
    }

    /// Whether this value belongs to the declared domain.
    ///
    /// Ordinal metrics may report either a label or a numeric level.
    pub fn conforms_to(&self, value_type: ValueType) -> bool {
        match (self, value_type) {
            (RawValue::Number(v), ValueType::Number) => v.is_finite(),
            (RawValue::Bool(_), ValueType::Boolean) => true,
            (RawValue::String(_), ValueType::String) => true,
            (RawValue::String(_), ValueType::Ordinal) => true,
            (RawValue::Number(v), ValueType::Ordinal) => v.is_finite(),
            _ => false,
        }
    }

    /// Key used for categorical lookups (ordinal maps, distributions).
    ///
    /// Integral numbers render without a fractional part so that a level of
    /// `3.0` matches the key `"3"`.
    pub fn category_key(&self) -> String {
        match self {
            RawValue::String(s) => s.clone(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Number(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Bool(b) => write!(f, "{}", b),
            RawValue::Number(v) => write!(f, "{}", v),
            RawValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_value_untagged_serialization() {
        assert_eq!(serde_json::to_string(&RawValue::Bool(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&RawValue::Number(0.5)).unwrap(), "0.5");

        let parsed: RawValue = serde_json::from_str("\"good\"").unwrap();
        assert_eq!(parsed, RawValue::String("good".to_string()));
        let parsed: RawValue = serde_json::from_str("false").unwrap();
        assert_eq!(parsed, RawValue::Bool(false));
    }

    #[test]
    fn test_conforms_to() {
        assert!(RawValue::Number(3.0).conforms_to(ValueType::Number));
        assert!(RawValue::Number(3.0).conforms_to(ValueType::Ordinal));
        assert!(RawValue::from("high").conforms_to(ValueType::Ordinal));
        assert!(!RawValue::Bool(true).conforms_to(ValueType::Number));
        assert!(!RawValue::Number(f64::NAN).conforms_to(ValueType::Number));
        assert!(!RawValue::from("x").conforms_to(ValueType::Boolean));
    }

    #[test]
    fn test_category_key() {
        assert_eq!(RawValue::Number(3.0).category_key(), "3");
        assert_eq!(RawValue::Number(2.5).category_key(), "2.5");
        assert_eq!(RawValue::Bool(false).category_key(), "false");
        assert_eq!(RawValue::from("ok").category_key(), "ok");
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(RawValue::Bool(true).as_numeric(), Some(1.0));
        assert_eq!(RawValue::Bool(true).as_f64(), None);
        assert_eq!(RawValue::from("1").as_numeric(), None);
    }
}
