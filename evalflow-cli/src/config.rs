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

//! Run file: metrics, scorers and evals described in TOML
//!
//! ```toml
//! [run]
//! max_concurrency = 4
//! policy = { mode = "selected_steps", indices = [0, 2] }
//!
//! [[metrics]]
//! name = "length"
//! builtin = "output_length"
//! normalizer = { type = "min-max", clip = true }
//! calibration = "dataset_range"
//!
//! [[evals]]
//! name = "length"
//! kind = "single_turn"
//! metric = "length"
//! verdict = { kind = "number-range", min = 0.0, max = 400.0 }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use evalflow_core::{Score, ValueType};
use evalflow_evals::{
    presets, AggregatorDef, AnthropicClient, Calibration, CalibrationContext, Eval, EvalKind,
    LLMClient, LlmJudge, MetricDefinition, MetricResultCache, MetricScope, NormalizationConfig,
    NormalizerSpec, OpenAIClient, RunOptions, RunPolicy, Scorer, ScorerInput, VerdictPolicy,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub scorers: Vec<ScorerConfig>,

    pub evals: Vec<EvalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    #[serde(default)]
    pub policy: RunPolicy,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Enables the metric result cache with this TTL
    pub cache_ttl_secs: Option<u64>,

    /// Forwarded to every metric producer
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            policy: RunPolicy::All,
            max_concurrency: default_max_concurrency(),
            cache_ttl_secs: None,
            metadata: HashMap::new(),
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub name: String,

    /// One of the preset metric names
    pub builtin: Option<String>,

    /// Required for LLM metrics
    pub value_type: Option<ValueType>,

    #[serde(default)]
    pub scope: MetricScope,

    pub llm: Option<LlmConfig>,

    pub normalizer: Option<NormalizerSpec>,

    pub calibration: Option<CalibrationConfig>,

    #[serde(default)]
    pub aggregators: Vec<AggregatorDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub provider: Provider,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub choices: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinCalibration {
    DatasetRange,
    DatasetMoments,
}

/// A preset calibration by name, or a fixed table of parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CalibrationConfig {
    Builtin(BuiltinCalibration),
    Static(CalibrationContext),
}

impl CalibrationConfig {
    fn build(&self) -> Calibration {
        match self {
            CalibrationConfig::Builtin(BuiltinCalibration::DatasetRange) => {
                Calibration::dataset_range()
            }
            CalibrationConfig::Builtin(BuiltinCalibration::DatasetMoments) => {
                Calibration::dataset_moments()
            }
            CalibrationConfig::Static(ctx) => Calibration::Static(ctx.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineConfig {
    WeightedAverage,
    Minimum,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScorerConfig {
    pub name: String,
    pub combine: CombineConfig,

    #[serde(default = "default_true")]
    pub normalize_weights: bool,

    pub fallback_score: Option<f64>,

    pub inputs: Vec<ScorerInputConfig>,

    #[serde(default)]
    pub aggregators: Vec<AggregatorDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScorerInputConfig {
    pub metric: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default = "default_true")]
    pub required: bool,

    pub normalizer: Option<NormalizerSpec>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    pub name: String,
    pub kind: EvalKind,
    pub metric: Option<String>,
    pub scorer: Option<String>,

    #[serde(default)]
    pub verdict: VerdictPolicy,
}

impl RunConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse run file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve names into evals and run options
    pub fn build(&self) -> Result<(Vec<Eval>, RunOptions)> {
        let mut metrics: HashMap<&str, Arc<MetricDefinition>> = HashMap::new();
        for config in &self.metrics {
            let metric = config
                .build()
                .with_context(|| format!("metric '{}'", config.name))?;
            if metrics.insert(&config.name, Arc::new(metric)).is_some() {
                bail!("metric '{}' is declared more than once", config.name);
            }
        }

        let lookup = |name: &str| {
            metrics
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown metric '{}'", name))
        };

        let mut scorers: HashMap<&str, Arc<Scorer>> = HashMap::new();
        for config in &self.scorers {
            let scorer = config
                .build(&lookup)
                .with_context(|| format!("scorer '{}'", config.name))?;
            if scorers.insert(&config.name, Arc::new(scorer)).is_some() {
                bail!("scorer '{}' is declared more than once", config.name);
            }
        }

        let evals = self
            .evals
            .iter()
            .map(|config| {
                config
                    .build(&lookup, &scorers)
                    .with_context(|| format!("eval '{}'", config.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut options = RunOptions::default()
            .with_policy(self.run.policy.clone())
            .with_max_concurrency(self.run.max_concurrency);
        for (key, value) in &self.run.metadata {
            options = options.with_metadata(key.clone(), value.clone());
        }
        if let Some(ttl) = self.run.cache_ttl_secs {
            options = options.with_result_cache(Arc::new(MetricResultCache::new(ttl)));
        }

        tracing::debug!(
            metrics = metrics.len(),
            scorers = scorers.len(),
            evals = evals.len(),
            "Built run configuration"
        );

        Ok((evals, options))
    }
}

impl EvalConfig {
    fn build<F>(&self, lookup: &F, scorers: &HashMap<&str, Arc<Scorer>>) -> Result<Eval>
    where
        F: Fn(&str) -> Result<Arc<MetricDefinition>>,
    {
        let eval = match self.kind {
            EvalKind::SingleTurn => {
                Eval::single_turn(&self.name, lookup(required(&self.metric, "metric")?)?)
            }
            EvalKind::MultiTurn => {
                Eval::multi_turn(&self.name, lookup(required(&self.metric, "metric")?)?)
            }
            EvalKind::Scorer => {
                let name = required(&self.scorer, "scorer")?;
                let scorer = scorers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown scorer '{}'", name))?;
                Eval::scorer(&self.name, scorer)
            }
        };
        Ok(eval.with_verdict(self.verdict.clone()))
    }
}

fn required<'a>(field: &'a Option<String>, what: &str) -> Result<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| anyhow!("eval needs a '{}' field", what))
}

impl MetricConfig {
    fn build(&self) -> Result<MetricDefinition> {
        let mut metric = match (&self.builtin, &self.llm) {
            (Some(builtin), None) => {
                if self.value_type.is_some() {
                    bail!("built-in metrics declare their own value type");
                }
                presets::builtin_metric(builtin, &self.name).ok_or_else(|| {
                    anyhow!(
                        "unknown built-in '{}', expected one of: {}",
                        builtin,
                        presets::BUILTIN_METRICS.join(", ")
                    )
                })?
            }
            (None, Some(llm)) => {
                let value_type = self
                    .value_type
                    .ok_or_else(|| anyhow!("LLM metrics need a value_type"))?;
                MetricDefinition::llm(&self.name, value_type, self.scope, llm.build()?)
            }
            (Some(_), Some(_)) => bail!("set either 'builtin' or 'llm', not both"),
            (None, None) => bail!("set one of 'builtin' or 'llm'"),
        };

        match (&self.normalizer, &self.calibration) {
            (Some(normalizer), calibration) => {
                let mut config = NormalizationConfig::new(normalizer.clone());
                if let Some(calibration) = calibration {
                    config = config.with_calibration(calibration.build());
                }
                metric = metric.with_normalization(config);
            }
            (None, Some(_)) => bail!("a calibration needs a normalizer"),
            (None, None) => {}
        }

        for aggregator in &self.aggregators {
            metric = metric.with_aggregator(aggregator.clone());
        }
        Ok(metric)
    }
}

impl LlmConfig {
    fn build(&self) -> Result<LlmJudge> {
        let api_key = std::env::var(&self.api_key_env)
            .with_context(|| format!("environment variable {} is not set", self.api_key_env))?;

        let client: Arc<dyn LLMClient> = match self.provider {
            Provider::OpenAI => {
                let mut client = OpenAIClient::new(api_key, self.model.clone());
                if let Some(url) = &self.base_url {
                    client = client.with_base_url(url.clone());
                }
                Arc::new(client)
            }
            Provider::Anthropic => {
                let mut client = AnthropicClient::new(api_key, self.model.clone());
                if let Some(url) = &self.base_url {
                    client = client.with_base_url(url.clone());
                }
                Arc::new(client)
            }
        };

        let mut judge = LlmJudge::new(client, self.prompt.clone());
        if let Some(system) = &self.system_prompt {
            judge = judge.with_system_prompt(system.clone());
        }
        if let Some(choices) = &self.choices {
            judge = judge.with_choices(choices.clone());
        }
        Ok(judge)
    }
}

impl ScorerConfig {
    fn build<F>(&self, lookup: &F) -> Result<Scorer>
    where
        F: Fn(&str) -> Result<Arc<MetricDefinition>>,
    {
        let inputs = self
            .inputs
            .iter()
            .map(|config| {
                let mut input =
                    ScorerInput::new(lookup(&config.metric)?).with_weight(config.weight);
                if !config.required {
                    input = input.optional();
                }
                if let Some(normalizer) = &config.normalizer {
                    input = input.with_normalizer(normalizer.clone());
                }
                Ok(input)
            })
            .collect::<Result<Vec<_>>>()?;

        let combine = match self.combine {
            CombineConfig::WeightedAverage => {
                presets::weighted_average(&inputs, self.normalize_weights)
            }
            CombineConfig::Minimum => presets::minimum(),
        };

        let mut scorer = Scorer::new(&self.name, inputs, combine);
        if let Some(fallback) = self.fallback_score {
            scorer = scorer.with_fallback(
                Score::new(fallback).context("fallback_score must be within [0, 1]")?,
            );
        }
        for aggregator in &self.aggregators {
            scorer = scorer.with_aggregator(aggregator.clone());
        }
        Ok(scorer)
    }
}
