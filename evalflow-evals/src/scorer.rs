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

//! Scorers: several normalized metric series combined into one derived score

use crate::aggregator::AggregatorDef;
use crate::metric::MetricDefinition;
use crate::normalizer::NormalizerSpec;
use crate::EvalError;
use evalflow_core::Score;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type CombineFn = dyn Fn(&BTreeMap<String, Score>) -> Result<Score, EvalError> + Send + Sync;

/// Maps metric name -> score to a single derived score
#[derive(Clone)]
pub struct Combiner(Arc<CombineFn>);

impl Combiner {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&BTreeMap<String, Score>) -> Result<Score, EvalError> + Send + Sync + 'static,
    {
        Combiner(Arc::new(f))
    }

    pub fn combine(&self, scores: &BTreeMap<String, Score>) -> Result<Score, EvalError> {
        (self.0)(scores)
    }
}

impl fmt::Debug for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Combiner(<fn>)")
    }
}

/// One metric feeding a scorer
#[derive(Debug, Clone)]
pub struct ScorerInput {
    pub metric: Arc<MetricDefinition>,
    pub weight: f64,
    pub required: bool,
    /// Used instead of the metric's own normalizer for this scorer only
    pub normalizer_override: Option<NormalizerSpec>,
}

impl ScorerInput {
    pub fn new(metric: Arc<MetricDefinition>) -> Self {
        Self {
            metric,
            weight: 1.0,
            required: true,
            normalizer_override: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerSpec) -> Self {
        self.normalizer_override = Some(normalizer);
        self
    }

    pub fn name(&self) -> &str {
        &self.metric.name
    }

    /// Normalizer this input is scored with, if any
    pub fn effective_normalizer(&self) -> Option<&NormalizerSpec> {
        self.normalizer_override.as_ref().or_else(|| {
            self.metric
                .normalization
                .as_ref()
                .map(|config| &config.normalizer)
        })
    }
}

/// Description of the derived value. Scorer output is always a number.
#[derive(Debug, Clone, Default)]
pub struct ScorerOutput {
    pub aggregators: Vec<AggregatorDef>,
}

#[derive(Debug, Clone)]
pub struct Scorer {
    pub name: String,
    pub output: ScorerOutput,
    pub inputs: Vec<ScorerInput>,
    pub combine: Combiner,
    /// Stands in for absent rows of optional inputs
    pub fallback_score: Option<Score>,
}

impl Scorer {
    pub fn new(name: impl Into<String>, inputs: Vec<ScorerInput>, combine: Combiner) -> Self {
        Self {
            name: name.into(),
            output: ScorerOutput::default(),
            inputs,
            combine,
            fallback_score: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Score) -> Self {
        self.fallback_score = Some(fallback);
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorDef) -> Self {
        self.output.aggregators.push(aggregator);
        self
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.inputs.is_empty() {
            return Err(EvalError::config(format!("scorer '{}' has no inputs", self.name)));
        }
        for input in &self.inputs {
            if !input.weight.is_finite() || input.weight < 0.0 {
                return Err(EvalError::config(format!(
                    "scorer '{}' input '{}' has invalid weight {}",
                    self.name,
                    input.name(),
                    input.weight
                )));
            }
            let normalizer = input.effective_normalizer().ok_or_else(|| {
                EvalError::config(format!(
                    "scorer '{}' input '{}' has no normalizer",
                    self.name,
                    input.name()
                ))
            })?;
            normalizer.validate()?;
            normalizer.check_compatible(input.metric.value_type)?;
        }
        Ok(())
    }

    /// Combine one target's normalized series into derived scores, one per row.
    ///
    /// `series` maps input metric name to that metric's scores for the target
    /// in step order. Row count is the longest series. A shorter series repeats
    /// its last element; an empty series falls back to `fallback_score` when
    /// the input is optional, and fails when it is required. Optional inputs
    /// with neither are left out of the combine map for that row.
    pub fn combine_rows(
        &self,
        series: &BTreeMap<String, Vec<Score>>,
        target_id: &str,
    ) -> Result<Vec<Score>, EvalError> {
        let lengths: Vec<usize> = self
            .inputs
            .iter()
            .map(|input| series.get(input.name()).map_or(0, Vec::len))
            .collect();
        let rows = lengths.iter().copied().max().unwrap_or(0);

        if lengths.iter().any(|&len| len != rows) {
            tracing::warn!(
                scorer = %self.name,
                target = target_id,
                ?lengths,
                "Scorer inputs have mismatched series lengths"
            );
        }

        let mut derived = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut scores = BTreeMap::new();
            for input in &self.inputs {
                let values = series.get(input.name()).map(Vec::as_slice).unwrap_or(&[]);
                let value = values
                    .get(row)
                    .or_else(|| values.last())
                    .copied()
                    .or(if input.required {
                        None
                    } else {
                        self.fallback_score
                    });

                match value {
                    Some(score) => {
                        scores.insert(input.name().to_string(), score);
                    }
                    None if input.required => {
                        return Err(EvalError::data(format!(
                            "scorer '{}' required input '{}' has no value for target '{}'",
                            self.name,
                            input.name(),
                            target_id
                        )));
                    }
                    None => {}
                }
            }

            if scores.is_empty() {
                continue;
            }
            derived.push(self.combine.combine(&scores)?);
        }

        Ok(derived)
    }
}
