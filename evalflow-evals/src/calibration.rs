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

//! Calibration: the context a normalizer needs, resolved once per metric per run

use crate::normalizer::NormalizerSpec;
use crate::EvalError;
use evalflow_core::{Dataset, RawValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Parameters normalizers fall back to when their own settings leave them unset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, f64>>,
}

impl CalibrationContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..Self::default()
        }
    }

    pub fn with_moments(mean: f64, std_dev: f64) -> Self {
        Self {
            mean: Some(mean),
            std_dev: Some(std_dev),
            ..Self::default()
        }
    }
}

/// Function over the full dataset and every raw value the metric produced
pub type CalibrationFn =
    dyn Fn(&Dataset, &[RawValue]) -> Result<CalibrationContext, EvalError> + Send + Sync;

#[derive(Clone)]
pub enum Calibration {
    Static(CalibrationContext),
    Derived(Arc<CalibrationFn>),
}

impl Calibration {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&Dataset, &[RawValue]) -> Result<CalibrationContext, EvalError>
            + Send
            + Sync
            + 'static,
    {
        Calibration::Derived(Arc::new(f))
    }

    /// Observed min/max of the numeric raw values
    pub fn dataset_range() -> Self {
        Self::derived(|_, values| {
            let numbers = numeric_values(values);
            if numbers.is_empty() {
                return Ok(CalibrationContext::empty());
            }
            let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Ok(CalibrationContext::with_range(min, max))
        })
    }

    /// Mean and population standard deviation of the numeric raw values
    pub fn dataset_moments() -> Self {
        Self::derived(|_, values| {
            let numbers = numeric_values(values);
            if numbers.is_empty() {
                return Ok(CalibrationContext::empty());
            }
            let n = numbers.len() as f64;
            let mean = numbers.iter().sum::<f64>() / n;
            let variance = numbers.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            Ok(CalibrationContext::with_moments(mean, variance.sqrt()))
        })
    }
}

fn numeric_values(values: &[RawValue]) -> Vec<f64> {
    values
        .iter()
        .filter_map(RawValue::as_numeric)
        .filter(|v| v.is_finite())
        .collect()
}

impl fmt::Debug for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calibration::Static(ctx) => f.debug_tuple("Static").field(ctx).finish(),
            Calibration::Derived(_) => f.write_str("Derived(<fn>)"),
        }
    }
}

/// Derived calibrations are equal only when they share the same function
impl PartialEq for Calibration {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Calibration::Static(a), Calibration::Static(b)) => a == b,
            (Calibration::Derived(a), Calibration::Derived(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How a metric's raw values become scores
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationConfig {
    pub normalizer: NormalizerSpec,
    pub calibration: Option<Calibration>,
}

impl NormalizationConfig {
    pub fn new(normalizer: NormalizerSpec) -> Self {
        Self {
            normalizer,
            calibration: None,
        }
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = Some(calibration);
        self
    }
}

/// Resolved contexts for one pipeline run, keyed by metric name.
///
/// Created inside each run and dropped with it.
#[derive(Debug, Default)]
pub struct CalibrationCache {
    resolved: Mutex<HashMap<String, Arc<CalibrationContext>>>,
}

impl CalibrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: &str) -> Option<Arc<CalibrationContext>> {
        self.resolved.lock().get(metric).cloned()
    }

    pub fn len(&self) -> usize {
        self.resolved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.lock().is_empty()
    }

    fn insert(&self, metric: &str, ctx: Arc<CalibrationContext>) {
        self.resolved.lock().insert(metric.to_string(), ctx);
    }
}

/// Resolve the calibration context for one metric.
///
/// Derived calibrations run at most once per metric name per cache.
pub fn resolve(
    config: Option<&NormalizationConfig>,
    dataset: &Dataset,
    raw_values: &[RawValue],
    metric: &str,
    cache: &CalibrationCache,
) -> Result<Arc<CalibrationContext>, EvalError> {
    if let Some(ctx) = cache.get(metric) {
        return Ok(ctx);
    }

    let ctx = match config.and_then(|c| c.calibration.as_ref()) {
        None => CalibrationContext::empty(),
        Some(Calibration::Static(ctx)) => ctx.clone(),
        Some(Calibration::Derived(f)) => {
            let ctx = f(dataset, raw_values)?;
            tracing::debug!(metric, values = raw_values.len(), ?ctx, "Derived calibration");
            ctx
        }
    };

    let ctx = Arc::new(ctx);
    cache.insert(metric, ctx.clone());
    Ok(ctx)
}
