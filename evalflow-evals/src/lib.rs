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

//! # Evalflow Evaluation Pipeline
//!
//! Turns raw metric measurements over a dataset of items and conversations
//! into scores, verdicts and statistical summaries.
//!
//! ## Phases
//!
//! 1. **Measure**: run every metric once per selected target ([`executor`])
//! 2. **Calibrate**: resolve normalizer context from the full raw-value set ([`calibration`])
//! 3. **Normalize**: map raw values to a [`Score`] in `[0, 1]` ([`normalizer`])
//! 4. **Combine**: derive scores from several metrics ([`scorer`])
//! 5. **Verdict**: apply pass/fail policies ([`verdict`])
//! 6. **Aggregate**: roll everything up per eval ([`aggregator`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use evalflow_evals::{presets, Eval, RunOptions, VerdictPolicy};
//! use std::sync::Arc;
//!
//! let exact = Arc::new(presets::builtin_metric("exact_match", "exact").unwrap());
//! let evals = vec![Eval::single_turn("exact", exact)
//!     .with_verdict(VerdictPolicy::Boolean { pass_when: true })];
//!
//! let output = evalflow_evals::run(&dataset, &evals, &RunOptions::default()).await?;
//! println!("{:?}", output.eval_summaries["exact"]);
//! ```

use evalflow_core::{CoreError, ScoreError};
use thiserror::Error;

pub mod aggregator;
pub mod cache;
pub mod calibration;
pub mod eval;
pub mod executor;
pub mod llm_client;
pub mod llm_judge;
pub mod metric;
pub mod normalizer;
pub mod pipeline;
pub mod presets;
pub mod scorer;
pub mod target;
pub mod verdict;

pub use aggregator::{
    AggregateSummary, AggregateValue, AggregationInput, AggregatorDef, BooleanAggregator,
    CategoricalAggregator, NumericAggregator,
};
pub use cache::{CacheKey, CacheStats, MetricResultCache};
pub use calibration::{Calibration, CalibrationCache, CalibrationContext, NormalizationConfig};
pub use eval::{Eval, EvalKind};
pub use evalflow_core::{
    Container, Conversation, ConversationStep, Dataset, DatasetItem, RawValue, Score, ToolCall,
    ValueType,
};
pub use executor::{Measurement, MetricExecutor, TargetMeasurements};
pub use llm_client::{AnthropicClient, LLMClient, LLMError, LLMResponse, OpenAIClient};
pub use llm_judge::LlmJudge;
pub use metric::{MeasureContext, MetricDefinition, MetricImplementation, MetricOutput, MetricScope};
pub use normalizer::{Direction, NormalizerSpec};
pub use pipeline::{
    run, EvalRow, EvalSummary, PerTargetResult, Pipeline, PipelineOutput, RunOptions,
    VerdictCounts,
};
pub use scorer::{Combiner, Scorer, ScorerInput, ScorerOutput};
pub use target::{RunPolicy, Target};
pub use verdict::{Verdict, VerdictPolicy};

/// Errors that can occur while running the pipeline
#[derive(Debug, Error)]
pub enum EvalError {
    /// Invalid or incompatible configuration, detected before the data needs it
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value the pipeline cannot process (out of range, unmapped, empty)
    #[error("Data error: {0}")]
    Data(String),

    /// A metric producer failed or returned an unusable value
    #[error("Metric '{metric}' failed: {message}")]
    Producer { metric: String, message: String },

    #[error("LLM client error: {0}")]
    LLMClientError(#[from] LLMError),

    #[error("Score error: {0}")]
    Score(#[from] ScoreError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    pub fn config(message: impl Into<String>) -> Self {
        EvalError::Config(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        EvalError::Data(message.into())
    }

    pub fn producer(metric: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Producer {
            metric: metric.into(),
            message: message.into(),
        }
    }
}
