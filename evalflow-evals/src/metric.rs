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

//! Metric definitions and producers

use crate::aggregator::AggregatorDef;
use crate::calibration::NormalizationConfig;
use crate::llm_judge::LlmJudge;
use crate::target::Target;
use crate::EvalError;
use evalflow_core::{Container, RawValue, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How often a metric runs per container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    /// Once per selected step or item
    #[default]
    Single,
    /// Once per whole container
    Multi,
}

impl fmt::Display for MetricScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricScope::Single => f.write_str("single"),
            MetricScope::Multi => f.write_str("multi"),
        }
    }
}

/// Everything a producer may look at besides the target itself
#[derive(Debug, Clone, Copy)]
pub struct MeasureContext<'a> {
    pub container: &'a Container,
    pub container_index: usize,
    pub target_id: &'a str,
    /// Run-level metadata, forwarded unchanged from the caller
    pub metadata: &'a HashMap<String, serde_json::Value>,
}

/// Pure code producer
pub type CodeProducer =
    dyn Fn(&Target<'_>, &MeasureContext<'_>) -> Result<RawValue, EvalError> + Send + Sync;

#[derive(Clone)]
pub enum MetricImplementation {
    Code(Arc<CodeProducer>),
    Llm(Arc<LlmJudge>),
}

impl fmt::Debug for MetricImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricImplementation::Code(_) => f.write_str("Code(<fn>)"),
            MetricImplementation::Llm(judge) => f.debug_tuple("Llm").field(judge).finish(),
        }
    }
}

/// What a producer hands back for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricOutput {
    pub raw_value: RawValue,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl MetricOutput {
    pub fn new(raw_value: RawValue) -> Self {
        Self {
            raw_value,
            confidence: None,
            reasoning: None,
        }
    }
}

/// A named measurement. The name is its identity within a run.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub name: String,
    pub value_type: ValueType,
    pub scope: MetricScope,
    pub implementation: MetricImplementation,
    pub normalization: Option<NormalizationConfig>,
    pub aggregators: Vec<AggregatorDef>,
}

impl MetricDefinition {
    pub fn code<F>(name: impl Into<String>, value_type: ValueType, scope: MetricScope, f: F) -> Self
    where
        F: Fn(&Target<'_>, &MeasureContext<'_>) -> Result<RawValue, EvalError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            value_type,
            scope,
            implementation: MetricImplementation::Code(Arc::new(f)),
            normalization: None,
            aggregators: Vec::new(),
        }
    }

    pub fn llm(
        name: impl Into<String>,
        value_type: ValueType,
        scope: MetricScope,
        judge: LlmJudge,
    ) -> Self {
        Self {
            name: name.into(),
            value_type,
            scope,
            implementation: MetricImplementation::Llm(Arc::new(judge)),
            normalization: None,
            aggregators: Vec::new(),
        }
    }

    pub fn with_normalization(mut self, normalization: NormalizationConfig) -> Self {
        self.normalization = Some(normalization);
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorDef) -> Self {
        self.aggregators.push(aggregator);
        self
    }

    pub fn is_llm(&self) -> bool {
        matches!(self.implementation, MetricImplementation::Llm(_))
    }

    /// Identity of what this definition measures, used for result caching.
    ///
    /// Code producers are identified by the closure they hold, so two
    /// separately built definitions never share cached values.
    pub fn fingerprint(&self) -> serde_json::Value {
        let producer = match &self.implementation {
            MetricImplementation::Code(f) => serde_json::json!({
                "code": Arc::as_ptr(f) as *const () as usize,
            }),
            MetricImplementation::Llm(judge) => serde_json::json!({ "llm": judge.fingerprint() }),
        };

        serde_json::json!({
            "name": self.name,
            "value_type": self.value_type,
            "scope": self.scope,
            "producer": producer,
        })
    }

    /// Run the producer once and check the value against the declared type
    pub async fn produce(
        &self,
        target: &Target<'_>,
        ctx: &MeasureContext<'_>,
    ) -> Result<MetricOutput, EvalError> {
        let output = match &self.implementation {
            MetricImplementation::Code(f) => f(target, ctx)
                .map(MetricOutput::new)
                .map_err(|e| self.as_producer_error(e))?,
            MetricImplementation::Llm(judge) => judge
                .judge(&self.name, self.value_type, target, ctx)
                .await
                .map_err(|e| self.as_producer_error(e))?,
        };

        if !output.raw_value.conforms_to(self.value_type) {
            return Err(EvalError::producer(
                &self.name,
                format!(
                    "produced a {} value ({}) but declares {}",
                    output.raw_value.kind_name(),
                    output.raw_value,
                    self.value_type
                ),
            ));
        }

        Ok(output)
    }

    fn as_producer_error(&self, err: EvalError) -> EvalError {
        match err {
            EvalError::Producer { .. } => err,
            other => EvalError::producer(&self.name, other.to_string()),
        }
    }
}
