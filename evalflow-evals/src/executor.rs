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

//! Metric executor: runs each metric against the selected targets of one container

use crate::cache::{CacheKey, MetricResultCache};
use crate::metric::{MeasureContext, MetricDefinition, MetricOutput};
use crate::target::{select_targets, RunPolicy, Target};
use crate::EvalError;
use chrono::{DateTime, Utc};
use evalflow_core::{Container, RawValue};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// One raw observation. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub metric: String,

    /// Step index, or `None` when the whole container was measured
    pub step: Option<usize>,

    pub raw_value: RawValue,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    pub execution_time_ms: u64,

    pub timestamp: DateTime<Utc>,

    /// Served from the caller's result cache
    pub cached: bool,
}

/// Every measurement taken for one container
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetMeasurements {
    pub target_id: String,
    pub container_index: usize,
    /// Metric name -> measurements in target order
    pub by_metric: BTreeMap<String, Vec<Measurement>>,
}

impl TargetMeasurements {
    pub fn get(&self, metric: &str) -> &[Measurement] {
        self.by_metric.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn measurement_count(&self) -> usize {
        self.by_metric.values().map(Vec::len).sum()
    }
}

pub struct MetricExecutor<'a> {
    policy: &'a RunPolicy,
    metadata: &'a HashMap<String, serde_json::Value>,
    cache: Option<&'a MetricResultCache>,
}

impl<'a> MetricExecutor<'a> {
    pub fn new(policy: &'a RunPolicy, metadata: &'a HashMap<String, serde_json::Value>) -> Self {
        Self {
            policy,
            metadata,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a MetricResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Measure one container.
    ///
    /// A metric name listed more than once runs only once; the set of names
    /// is fixed before anything is dispatched.
    pub async fn execute(
        &self,
        container: &Container,
        container_index: usize,
        metrics: &[Arc<MetricDefinition>],
    ) -> Result<TargetMeasurements, EvalError> {
        let target_id = container.target_id(container_index);

        let mut seen = HashSet::new();
        let unique: Vec<&MetricDefinition> = metrics
            .iter()
            .map(Arc::as_ref)
            .filter(|metric| seen.insert(metric.name.clone()))
            .collect();

        let ctx = MeasureContext {
            container,
            container_index,
            target_id: &target_id,
            metadata: self.metadata,
        };

        let results =
            try_join_all(unique.iter().map(|metric| self.measure_metric(metric, &ctx))).await?;

        let by_metric: BTreeMap<String, Vec<Measurement>> = unique
            .iter()
            .map(|metric| metric.name.clone())
            .zip(results)
            .collect();

        tracing::debug!(
            target = %target_id,
            metrics = by_metric.len(),
            measurements = by_metric.values().map(Vec::len).sum::<usize>(),
            "Measured container"
        );

        Ok(TargetMeasurements {
            target_id,
            container_index,
            by_metric,
        })
    }

    async fn measure_metric(
        &self,
        metric: &MetricDefinition,
        ctx: &MeasureContext<'_>,
    ) -> Result<Vec<Measurement>, EvalError> {
        let targets =
            select_targets(ctx.container, ctx.container_index, metric.scope, self.policy)?;
        try_join_all(targets.iter().map(|target| self.measure_target(metric, target, ctx))).await
    }

    async fn measure_target(
        &self,
        metric: &MetricDefinition,
        target: &Target<'_>,
        ctx: &MeasureContext<'_>,
    ) -> Result<Measurement, EvalError> {
        let started = Instant::now();
        let timestamp = Utc::now();

        let (output, cached) = match self.cache {
            Some(cache) => {
                let key = CacheKey::new(metric, target, ctx);
                match cache.get(&key).await {
                    Some(output) => (output, true),
                    None => {
                        let output = metric.produce(target, ctx).await?;
                        cache.set(key, output.clone()).await;
                        (output, false)
                    }
                }
            }
            None => (metric.produce(target, ctx).await?, false),
        };

        let MetricOutput {
            raw_value,
            confidence,
            reasoning,
        } = output;

        Ok(Measurement {
            metric: metric.name.clone(),
            step: target.step_index(),
            raw_value,
            confidence,
            reasoning,
            execution_time_ms: started.elapsed().as_millis() as u64,
            timestamp,
            cached,
        })
    }
}
