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

//! Evalflow CLI
//!
//! Runs an evaluation pipeline described by a TOML run file over a JSON dataset.

mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use config::RunConfig;
use evalflow_core::Dataset;
use evalflow_evals::Pipeline;
use output::Format;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "evalflow")]
#[command(about = "Evalflow - measure, score and judge model outputs", long_about = None)]
struct Cli {
    /// Run file (TOML) describing metrics, scorers and evals
    run_file: PathBuf,

    /// Dataset (JSON array of items and conversations)
    dataset: PathBuf,

    /// Report format
    #[arg(short, long, value_enum, default_value = "plain")]
    format: Format,

    /// Also write the full JSON report to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "evalflow=debug,evalflow_evals=debug,evalflow_core=debug"
    } else {
        "evalflow=info,evalflow_evals=info,evalflow_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = RunConfig::from_file(&cli.run_file)?;
    let (evals, options) = config.build().context("Invalid run file")?;
    let pipeline = Pipeline::new(evals).context("Invalid eval configuration")?;

    let dataset = Dataset::from_json_file(&cli.dataset)
        .with_context(|| format!("Failed to load dataset {}", cli.dataset.display()))?;
    info!(
        containers = dataset.len(),
        evals = pipeline.evals().len(),
        "Loaded run file and dataset"
    );

    let result = pipeline
        .run(&dataset, &options)
        .await
        .context("Evaluation run failed")?;

    println!("{}", output::render(&result, cli.format)?);

    if let Some(path) = &cli.output {
        output::write_json(&result, path)?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}
