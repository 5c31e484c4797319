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

//! Report rendering

use anyhow::{Context, Result};
use clap::ValueEnum;
use evalflow_evals::{AggregateValue, PipelineOutput};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

pub fn render(output: &PipelineOutput, format: Format) -> Result<String> {
    match format {
        Format::Plain => Ok(render_plain(output)),
        Format::Json => render_json(output),
    }
}

pub fn render_json(output: &PipelineOutput) -> Result<String> {
    serde_json::to_string_pretty(output).context("Failed to serialize run output")
}

/// Human-readable summary: one line per eval, aggregates indented below it
pub fn render_plain(output: &PipelineOutput) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} ({} targets, {} ms)",
        output.run_id,
        output.per_target_results.len(),
        output.duration_ms
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<24} {:<12} {:>6} {:>6} {:>6} {:>8} {:>10} {:>10}",
        "EVAL", "KIND", "ROWS", "PASS", "FAIL", "UNKNOWN", "PASS RATE", "MEAN"
    );

    for (name, summary) in &output.eval_summaries {
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:>6} {:>6} {:>6} {:>8} {:>10} {:>10}",
            name,
            summary.kind.to_string(),
            summary.sample_count,
            summary.verdicts.pass,
            summary.verdicts.fail,
            summary.verdicts.unknown,
            summary
                .pass_rate
                .map(|r| format!("{:.1}%", r * 100.0))
                .unwrap_or_else(|| "-".to_string()),
            summary
                .mean_score
                .map(|m| format!("{:.4}", m))
                .unwrap_or_else(|| "-".to_string()),
        );

        for aggregate in output.aggregate_summaries.get(name).into_iter().flatten() {
            let _ = writeln!(
                out,
                "    {} = {} (n={})",
                aggregate.aggregator,
                format_value(&aggregate.value),
                aggregate.sample_count
            );
        }
    }

    out
}

fn format_value(value: &AggregateValue) -> String {
    match value {
        AggregateValue::Number(v) => format!("{:.4}", v),
        AggregateValue::Counts(counts) => counts
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", "),
        AggregateValue::Proportions(shares) => shares
            .iter()
            .map(|(k, v)| format!("{}={:.3}", k, v))
            .collect::<Vec<_>>()
            .join(", "),
        AggregateValue::Modes(modes) => modes.join(", "),
    }
}

pub fn write_json(output: &PipelineOutput, path: &Path) -> Result<()> {
    let json = render_json(output)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalflow_evals::{presets, run, Dataset, DatasetItem, Eval, RunOptions, VerdictPolicy};
    use evalflow_evals::{AggregatorDef, BooleanAggregator};
    use std::sync::Arc;

    async fn sample_output() -> PipelineOutput {
        let exact = presets::builtin_metric("exact_match", "exact")
            .unwrap()
            .with_aggregator(AggregatorDef::Boolean(BooleanAggregator::TrueRate));
        let evals = vec![Eval::single_turn("exact", Arc::new(exact))
            .with_verdict(VerdictPolicy::Boolean { pass_when: true })];
        let dataset = Dataset::new(vec![
            DatasetItem::new("2+2", "4").with_expected("4").into(),
            DatasetItem::new("3+3", "7").with_expected("6").into(),
        ]);
        run(&dataset, &evals, &RunOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_render_plain() {
        let output = sample_output().await;
        let text = render_plain(&output);

        let row = text.lines().find(|l| l.starts_with("exact")).unwrap();
        let columns: Vec<&str> = row.split_whitespace().collect();
        assert_eq!(columns, vec!["exact", "single_turn", "2", "1", "1", "0", "50.0%", "-"]);
        assert!(text.contains("    true_rate = 0.5000 (n=2)"));
    }

    #[tokio::test]
    async fn test_write_json() {
        let output = sample_output().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_json(&output, &path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["eval_summaries"]["exact"]["verdicts"]["pass"], 1);
        assert_eq!(
            parsed["per_target_results"]["target-1"]["evals"]["exact"][0]["verdict"],
            "fail"
        );
    }
}
