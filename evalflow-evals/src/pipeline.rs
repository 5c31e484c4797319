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

//! Pipeline orchestrator
//!
//! Runs the six phases strictly in sequence. Each phase finishes for every
//! target before the next one starts, and only reads the previous phase's
//! output plus the immutable eval configuration.

use crate::aggregator::{AggregateSummary, AggregationInput, AggregatorDef};
use crate::cache::MetricResultCache;
use crate::calibration::{self, CalibrationCache, CalibrationContext};
use crate::eval::{Eval, EvalKind};
use crate::executor::{Measurement, MetricExecutor, TargetMeasurements};
use crate::metric::MetricDefinition;
use crate::normalizer::{self, NormalizerSpec};
use crate::scorer::Scorer;
use crate::target::RunPolicy;
use crate::verdict::{self, Verdict};
use crate::EvalError;
use chrono::{DateTime, Utc};
use evalflow_core::{Dataset, RawValue, Score};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Per-run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub policy: RunPolicy,

    /// Forwarded unchanged to every producer
    pub metadata: HashMap<String, serde_json::Value>,

    /// Caller-owned cache of metric outputs
    pub result_cache: Option<Arc<MetricResultCache>>,

    /// Containers measured concurrently
    pub max_concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: RunPolicy::All,
            metadata: HashMap::new(),
            result_cache: None,
            max_concurrency: 8,
        }
    }
}

impl RunOptions {
    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_result_cache(mut self, cache: Arc<MetricResultCache>) -> Self {
        self.result_cache = Some(cache);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

/// One judged row of an eval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRow {
    pub step: Option<usize>,
    pub raw_value: RawValue,
    pub score: Option<Score>,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerTargetResult {
    pub target_id: String,
    pub container_index: usize,
    pub measurements: BTreeMap<String, Vec<Measurement>>,
    /// Eval name -> rows in step order
    pub evals: BTreeMap<String, Vec<EvalRow>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub pass: usize,
    pub fail: usize,
    pub unknown: usize,
}

impl VerdictCounts {
    fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Unknown => self.unknown += 1,
        }
    }

    /// `pass / (pass + fail)`; unknown rows are left out
    pub fn pass_rate(&self) -> Option<f64> {
        let decided = self.pass + self.fail;
        if decided == 0 {
            None
        } else {
            Some(self.pass as f64 / decided as f64)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub eval: String,
    pub kind: EvalKind,
    pub sample_count: usize,
    pub verdicts: VerdictCounts,
    pub pass_rate: Option<f64>,
    pub mean_score: Option<f64>,
}

impl fmt::Display for EvalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} rows, {} pass / {} fail / {} unknown",
            self.eval,
            self.kind,
            self.sample_count,
            self.verdicts.pass,
            self.verdicts.fail,
            self.verdicts.unknown
        )?;
        if let Some(rate) = self.pass_rate {
            write!(f, ", {:.1}% pass rate", rate * 100.0)?;
        }
        if let Some(mean) = self.mean_score {
            write!(f, ", mean score {:.4}", mean)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Keyed by target id
    pub per_target_results: BTreeMap<String, PerTargetResult>,
    /// Keyed by eval name
    pub eval_summaries: BTreeMap<String, EvalSummary>,
    /// Keyed by eval name
    pub aggregate_summaries: BTreeMap<String, Vec<AggregateSummary>>,
}

/// Scores produced by the normalize phase for one target
#[derive(Debug, Default)]
struct NormalizedTarget {
    /// Metric name -> scores, for metrics with their own normalization
    metric_scores: BTreeMap<String, Vec<Score>>,
    /// Scorer eval name -> input metric -> scores
    scorer_series: BTreeMap<String, BTreeMap<String, Vec<Score>>>,
}

/// Derived rows for one target: scorer eval name -> (step, score)
type DerivedRows = BTreeMap<String, Vec<(Option<usize>, Score)>>;

/// A validated, immutable set of evals
#[derive(Debug, Clone)]
pub struct Pipeline {
    evals: Vec<Eval>,
    metrics: Vec<Arc<MetricDefinition>>,
}

impl Pipeline {
    /// Validate the configuration and collect the distinct metrics.
    ///
    /// Metrics are identified by name; the first definition seen for a name is
    /// the one measured. Definitions that disagree on value type, scope or
    /// normalization settings are rejected.
    pub fn new(evals: Vec<Eval>) -> Result<Self, EvalError> {
        let mut eval_names = HashSet::new();
        let mut metrics: Vec<Arc<MetricDefinition>> = Vec::new();

        for eval in &evals {
            if !eval_names.insert(eval.name().to_string()) {
                return Err(EvalError::config(format!(
                    "duplicate eval name '{}'",
                    eval.name()
                )));
            }
            eval.validate()?;

            for metric in eval.metrics() {
                match metrics.iter().find(|m| m.name == metric.name) {
                    Some(existing)
                        if existing.value_type != metric.value_type
                            || existing.scope != metric.scope
                            || existing.normalization != metric.normalization =>
                    {
                        return Err(EvalError::config(format!(
                            "metric '{}' is defined more than once with conflicting settings",
                            metric.name
                        )));
                    }
                    Some(_) => {}
                    None => metrics.push(Arc::clone(metric)),
                }
            }
        }

        Ok(Self { evals, metrics })
    }

    pub fn evals(&self) -> &[Eval] {
        &self.evals
    }

    /// Distinct metrics, in first-reference order
    pub fn metrics(&self) -> &[Arc<MetricDefinition>] {
        &self.metrics
    }

    pub async fn run(
        &self,
        dataset: &Dataset,
        options: &RunOptions,
    ) -> Result<PipelineOutput, EvalError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_phases(run_id, dataset, options)
            .instrument(span)
            .await
    }

    async fn run_phases(
        &self,
        run_id: Uuid,
        dataset: &Dataset,
        options: &RunOptions,
    ) -> Result<PipelineOutput, EvalError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        dataset.validate_target_ids()?;
        options.policy.validate(dataset.len())?;
        if options.max_concurrency == 0 {
            return Err(EvalError::config("max_concurrency must be at least 1"));
        }

        info!(
            containers = dataset.len(),
            evals = self.evals.len(),
            metrics = self.metrics.len(),
            "Starting evaluation run"
        );

        let measured = self.measure(dataset, options).await?;
        let contexts = self.calibrate(dataset, &measured)?;
        let normalized = self.normalize(&measured, &contexts)?;
        let derived = self.combine(&measured, &normalized)?;
        let per_target = self.judge(&measured, &normalized, &derived);
        let (eval_summaries, aggregate_summaries) = self.aggregate(&per_target)?;

        let per_target_results = per_target
            .into_iter()
            .map(|result| (result.target_id.clone(), result))
            .collect();

        let duration_ms = clock.elapsed().as_millis() as u64;
        info!(duration_ms, "Evaluation run complete");

        Ok(PipelineOutput {
            run_id,
            started_at,
            duration_ms,
            per_target_results,
            eval_summaries,
            aggregate_summaries,
        })
    }

    /// Phase 1: every distinct metric against every selected target
    async fn measure(
        &self,
        dataset: &Dataset,
        options: &RunOptions,
    ) -> Result<Vec<TargetMeasurements>, EvalError> {
        let executor = MetricExecutor::new(&options.policy, &options.metadata)
            .with_cache(options.result_cache.as_deref());

        let measured: Vec<TargetMeasurements> = stream::iter(dataset.iter().enumerate())
            .map(|(index, container)| executor.execute(container, index, &self.metrics))
            .buffered(options.max_concurrency)
            .try_collect()
            .await?;

        let measurements: usize = measured
            .iter()
            .map(TargetMeasurements::measurement_count)
            .sum();
        info!(targets = measured.len(), measurements, "Measure phase complete");
        Ok(measured)
    }

    /// Phase 2: one context per metric from the complete raw-value set
    fn calibrate(
        &self,
        dataset: &Dataset,
        measured: &[TargetMeasurements],
    ) -> Result<HashMap<String, Arc<CalibrationContext>>, EvalError> {
        let cache = CalibrationCache::new();
        let mut contexts = HashMap::new();

        for metric in &self.metrics {
            let raw_values: Vec<RawValue> = measured
                .iter()
                .flat_map(|target| target.get(&metric.name))
                .map(|m| m.raw_value.clone())
                .collect();
            let ctx = calibration::resolve(
                metric.normalization.as_ref(),
                dataset,
                &raw_values,
                &metric.name,
                &cache,
            )?;
            contexts.insert(metric.name.clone(), ctx);
        }

        info!(metrics = cache.len(), "Calibrate phase complete");
        Ok(contexts)
    }

    /// Phase 3: raw values to scores
    fn normalize(
        &self,
        measured: &[TargetMeasurements],
        contexts: &HashMap<String, Arc<CalibrationContext>>,
    ) -> Result<Vec<NormalizedTarget>, EvalError> {
        let empty = CalibrationContext::empty();
        let context_for = |metric: &str| contexts.get(metric).map(Arc::as_ref).unwrap_or(&empty);

        let normalized = measured
            .iter()
            .map(|target| {
                let mut metric_scores = BTreeMap::new();
                for metric in &self.metrics {
                    if let Some(config) = &metric.normalization {
                        let scores = normalize_series(
                            target.get(&metric.name),
                            &config.normalizer,
                            context_for(&metric.name),
                            &metric.name,
                        )?;
                        metric_scores.insert(metric.name.clone(), scores);
                    }
                }

                let mut scorer_series = BTreeMap::new();
                for eval in &self.evals {
                    if let Eval::Scorer { name, scorer, .. } = eval {
                        let mut series = BTreeMap::new();
                        for input in &scorer.inputs {
                            let scores = match &input.normalizer_override {
                                Some(spec) => normalize_series(
                                    target.get(input.name()),
                                    spec,
                                    context_for(input.name()),
                                    input.name(),
                                )?,
                                None => metric_scores
                                    .get(input.name())
                                    .cloned()
                                    .unwrap_or_default(),
                            };
                            series.insert(input.name().to_string(), scores);
                        }
                        scorer_series.insert(name.clone(), series);
                    }
                }

                Ok::<_, EvalError>(NormalizedTarget {
                    metric_scores,
                    scorer_series,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            scores = normalized
                .iter()
                .map(|n| n.metric_scores.values().map(Vec::len).sum::<usize>())
                .sum::<usize>(),
            "Normalize phase complete"
        );
        Ok(normalized)
    }

    /// Phase 4: derived scores for scorer evals
    fn combine(
        &self,
        measured: &[TargetMeasurements],
        normalized: &[NormalizedTarget],
    ) -> Result<Vec<DerivedRows>, EvalError> {
        let empty = BTreeMap::new();
        let mut derived = Vec::with_capacity(measured.len());

        for (target, scores) in measured.iter().zip(normalized) {
            let mut rows = DerivedRows::new();
            for eval in &self.evals {
                if let Eval::Scorer { name, scorer, .. } = eval {
                    let series = scores.scorer_series.get(name).unwrap_or(&empty);
                    let combined = scorer.combine_rows(series, &target.target_id)?;
                    let steps = row_steps(scorer, target, combined.len());
                    rows.insert(name.clone(), steps.into_iter().zip(combined).collect());
                }
            }
            derived.push(rows);
        }

        info!(
            rows = derived
                .iter()
                .map(|d| d.values().map(Vec::len).sum::<usize>())
                .sum::<usize>(),
            "Combine phase complete"
        );
        Ok(derived)
    }

    /// Phase 5: verdicts per eval row
    fn judge(
        &self,
        measured: &[TargetMeasurements],
        normalized: &[NormalizedTarget],
        derived: &[DerivedRows],
    ) -> Vec<PerTargetResult> {
        let results: Vec<PerTargetResult> = measured
            .iter()
            .zip(normalized)
            .zip(derived)
            .map(|((target, scores), derived)| {
                let evals = self
                    .evals
                    .iter()
                    .map(|eval| {
                        let rows = match eval {
                            Eval::SingleTurn {
                                metric, verdict, ..
                            }
                            | Eval::MultiTurn {
                                metric, verdict, ..
                            } => metric_rows(
                                target.get(&metric.name),
                                scores.metric_scores.get(&metric.name),
                                verdict,
                            ),
                            Eval::Scorer { name, verdict, .. } => derived
                                .get(name)
                                .map(|rows| scorer_rows(rows, verdict))
                                .unwrap_or_default(),
                        };
                        (eval.name().to_string(), rows)
                    })
                    .collect();

                debug!(target = %target.target_id, "Judged target");

                PerTargetResult {
                    target_id: target.target_id.clone(),
                    container_index: target.container_index,
                    measurements: target.by_metric.clone(),
                    evals,
                }
            })
            .collect();

        info!(targets = results.len(), "Verdict phase complete");
        results
    }

    /// Phase 6: per-eval summaries and aggregator rollups
    #[allow(clippy::type_complexity)]
    fn aggregate(
        &self,
        per_target: &[PerTargetResult],
    ) -> Result<
        (
            BTreeMap<String, EvalSummary>,
            BTreeMap<String, Vec<AggregateSummary>>,
        ),
        EvalError,
    > {
        let mut eval_summaries = BTreeMap::new();
        let mut aggregate_summaries = BTreeMap::new();

        for eval in &self.evals {
            let rows: Vec<&EvalRow> = per_target
                .iter()
                .flat_map(|result| result.evals.get(eval.name()).into_iter().flatten())
                .collect();

            let mut verdicts = VerdictCounts::default();
            for row in &rows {
                verdicts.record(row.verdict);
            }

            let scores: Vec<f64> = rows.iter().filter_map(|r| r.score).map(Score::value).collect();
            let mean_score = if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            };

            let summaries = eval
                .aggregators()
                .iter()
                .map(|aggregator| aggregate_rows(eval, aggregator, &rows, &scores))
                .collect::<Result<Vec<_>, EvalError>>()?;

            let summary = EvalSummary {
                eval: eval.name().to_string(),
                kind: eval.kind(),
                sample_count: rows.len(),
                verdicts,
                pass_rate: verdicts.pass_rate(),
                mean_score,
            };
            debug!(%summary, "Eval summarized");

            eval_summaries.insert(eval.name().to_string(), summary);
            aggregate_summaries.insert(eval.name().to_string(), summaries);
        }

        info!(evals = eval_summaries.len(), "Aggregate phase complete");
        Ok((eval_summaries, aggregate_summaries))
    }
}

/// Validate and run a set of evals in one call
pub async fn run(
    dataset: &Dataset,
    evals: &[Eval],
    options: &RunOptions,
) -> Result<PipelineOutput, EvalError> {
    Pipeline::new(evals.to_vec())?.run(dataset, options).await
}

fn normalize_series(
    measurements: &[Measurement],
    spec: &NormalizerSpec,
    ctx: &CalibrationContext,
    metric: &str,
) -> Result<Vec<Score>, EvalError> {
    measurements
        .iter()
        .map(|m| normalizer::apply(&m.raw_value, spec, ctx, metric))
        .collect()
}

/// Step labels for scorer rows, taken from the longest input series
fn row_steps(scorer: &Scorer, target: &TargetMeasurements, rows: usize) -> Vec<Option<usize>> {
    let longest = scorer
        .inputs
        .iter()
        .map(|input| target.get(input.name()))
        .max_by_key(|measurements| measurements.len())
        .unwrap_or(&[]);
    (0..rows)
        .map(|row| longest.get(row).and_then(|m| m.step))
        .collect()
}

fn metric_rows(
    measurements: &[Measurement],
    scores: Option<&Vec<Score>>,
    policy: &verdict::VerdictPolicy,
) -> Vec<EvalRow> {
    measurements
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let score = scores.and_then(|s| s.get(i)).copied();
            EvalRow {
                step: m.step,
                raw_value: m.raw_value.clone(),
                score,
                verdict: verdict::evaluate(score, Some(&m.raw_value), policy),
                reasoning: m.reasoning.clone(),
                confidence: m.confidence,
            }
        })
        .collect()
}

fn scorer_rows(rows: &[(Option<usize>, Score)], policy: &verdict::VerdictPolicy) -> Vec<EvalRow> {
    rows.iter()
        .map(|(step, score)| {
            let raw_value = RawValue::Number(score.value());
            EvalRow {
                step: *step,
                verdict: verdict::evaluate(Some(*score), Some(&raw_value), policy),
                raw_value,
                score: Some(*score),
                reasoning: None,
                confidence: None,
            }
        })
        .collect()
}

fn aggregate_rows(
    eval: &Eval,
    aggregator: &AggregatorDef,
    rows: &[&EvalRow],
    scores: &[f64],
) -> Result<AggregateSummary, EvalError> {
    let context = |e: EvalError| match e {
        EvalError::Data(msg) => EvalError::data(format!("eval '{}': {}", eval.name(), msg)),
        other => other,
    };

    match aggregator {
        AggregatorDef::Numeric(_) if eval.aggregates_scores() => aggregator
            .aggregate(AggregationInput::Scores(scores))
            .map_err(context),
        AggregatorDef::Numeric(_) => {
            let numbers: Vec<f64> = rows.iter().filter_map(|r| r.raw_value.as_numeric()).collect();
            aggregator
                .aggregate(AggregationInput::Numbers(&numbers))
                .map_err(context)
        }
        AggregatorDef::Boolean(_) => {
            let booleans: Vec<bool> = rows.iter().filter_map(|r| r.raw_value.as_bool()).collect();
            aggregator
                .aggregate(AggregationInput::Booleans(&booleans))
                .map_err(context)
        }
        AggregatorDef::Categorical(_) => {
            let categories: Vec<String> = rows.iter().map(|r| r.raw_value.category_key()).collect();
            aggregator
                .aggregate(AggregationInput::Categories(&categories))
                .map_err(context)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Calibration, NormalizationConfig};
    use crate::metric::MetricScope;
    use evalflow_core::{DatasetItem, ValueType};

    fn bool_metric(name: &str, scope: MetricScope) -> Arc<MetricDefinition> {
        Arc::new(MetricDefinition::code(name, ValueType::Boolean, scope, |_, _| {
            Ok(RawValue::Bool(true))
        }))
    }

    #[test]
    fn test_duplicate_eval_names_rejected() {
        let metric = bool_metric("m", MetricScope::Single);
        let err = Pipeline::new(vec![
            Eval::single_turn("e", metric.clone()),
            Eval::single_turn("e", metric),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate eval name"));
    }

    #[test]
    fn test_conflicting_metric_definitions_rejected() {
        let single = bool_metric("m", MetricScope::Single);
        let multi = bool_metric("m", MetricScope::Multi);
        let err = Pipeline::new(vec![
            Eval::single_turn("a", single),
            Eval::multi_turn("b", multi),
        ])
        .unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
    }

    #[test]
    fn test_metrics_deduplicated_by_name() {
        let pipeline = Pipeline::new(vec![
            Eval::single_turn("a", bool_metric("m", MetricScope::Single)),
            Eval::single_turn("b", bool_metric("m", MetricScope::Single)),
        ])
        .unwrap();
        assert_eq!(pipeline.metrics().len(), 1);
    }

    fn scaled_length(max: f64) -> Arc<MetricDefinition> {
        Arc::new(
            MetricDefinition::code("len", ValueType::Number, MetricScope::Single, |t, _| {
                Ok(RawValue::Number(t.output().len() as f64))
            })
            .with_normalization(NormalizationConfig::new(NormalizerSpec::min_max(0.0, max))),
        )
    }

    #[test]
    fn test_conflicting_normalizers_rejected() {
        let err = Pipeline::new(vec![
            Eval::single_turn("a", scaled_length(10.0)),
            Eval::single_turn("b", scaled_length(100.0)),
        ])
        .unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
        assert!(err.to_string().contains("'len'"));
    }

    #[test]
    fn test_equal_normalizers_share_one_metric() {
        let pipeline = Pipeline::new(vec![
            Eval::single_turn("a", scaled_length(10.0)),
            Eval::single_turn("b", scaled_length(10.0)),
        ])
        .unwrap();
        assert_eq!(pipeline.metrics().len(), 1);
    }

    #[test]
    fn test_derived_calibrations_compared_by_function() {
        let shared = Calibration::dataset_range();
        assert_eq!(shared, shared.clone());
        assert_ne!(Calibration::dataset_range(), Calibration::dataset_range());
        assert_eq!(
            Calibration::Static(CalibrationContext::with_range(0.0, 1.0)),
            Calibration::Static(CalibrationContext::with_range(0.0, 1.0))
        );
    }

    #[tokio::test]
    async fn test_selected_item_out_of_range() {
        let dataset = Dataset::new(vec![DatasetItem::new("q", "a").into()]);
        let options = RunOptions::default().with_policy(RunPolicy::SelectedItems(vec![3]));
        let evals = vec![Eval::single_turn("a", bool_metric("m", MetricScope::Single))];
        let err = run(&dataset, &evals, &options).await.unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
    }

    #[test]
    fn test_verdict_counts_pass_rate_ignores_unknown() {
        let mut counts = VerdictCounts::default();
        assert_eq!(counts.pass_rate(), None);
        for verdict in [Verdict::Pass, Verdict::Fail, Verdict::Unknown, Verdict::Pass] {
            counts.record(verdict);
        }
        let rate = counts.pass_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);
    }
}
