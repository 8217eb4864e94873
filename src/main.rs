//! traitscope CLI.
//!
//! Drives the profiling engine against the built-in simulator: `profile`
//! runs one simulated profile and prints the full report, `panel` runs an
//! N-seed panel and prints the acceptance summary, `bank` prints bank
//! statistics. All output is JSON on stdout; logs go to stderr via
//! `RUST_LOG`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use traitscope::{
    bank_stats, build_item_bank, run_panel, sample_true_thetas, summarize_reports, Engine,
    RunConfig, SimulatedModel,
};

#[derive(Parser)]
#[command(name = "traitscope", version, about = "Adaptive LLM trait profiling")]
struct Cli {
    /// Optional TOML run configuration.
    #[arg(long, global = true, env = "TRAITSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Bank generation seed.
    #[arg(long, global = true, default_value_t = 17)]
    bank_seed: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one simulated profile and print the full report.
    Profile {
        /// Engine/simulator seed.
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Run id; generated when omitted.
        #[arg(long)]
        run_id: Option<String>,
        /// Simulate a benchmark-trained model.
        #[arg(long)]
        benchmark_trained: bool,
        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },
    /// Run a simulated panel and print the summary.
    Panel {
        #[arg(long, default_value_t = 24)]
        runs: u32,
        #[arg(long, default_value_t = 1200)]
        seed: u64,
        #[arg(long)]
        benchmark_trained: bool,
    },
    /// Print item bank statistics.
    Bank,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RunConfig {
            model_id: "simulated-model".to_string(),
            ..Default::default()
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let bank = build_item_bank(cli.bank_seed);

    match cli.command {
        Command::Profile {
            seed,
            run_id,
            benchmark_trained,
            pretty,
        } => {
            let thetas = sample_true_thetas(seed);
            let adapter = SimulatedModel::new(thetas, seed + 1).benchmark_trained(benchmark_trained);
            let mut engine = Engine::new(config, bank, seed + 2)?;
            let report = engine.run(&adapter, run_id.as_deref(), None).await?;
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
        }
        Command::Panel {
            runs,
            seed,
            benchmark_trained,
        } => {
            let reports = run_panel(runs, seed, benchmark_trained, Some(config), Some(bank)).await?;
            let summary = summarize_reports(&reports)
                .context("panel produced no reports; runs must be > 0")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Bank => {
            println!("{}", serde_json::to_string_pretty(&bank_stats(&bank))?);
        }
    }

    Ok(())
}
