//! Vessel Protocol Simulation Binary
//!
//! Deploys the protocol ledger, runs the period loop and writes one CSV row
//! per period.
//!
//! ## Usage
//! ```bash
//! cargo run --bin simulate --release
//! cargo run --bin simulate --release -- --config sim.json --n-sim 200 -v
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use gravita_simulation::config::SimulationConfig;
use gravita_simulation::price_path::PriceModel;
use gravita_simulation::report::Expectations;
use gravita_simulation::Simulation;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PriceModelArg {
    RandomWalk,
    Gbm,
    JumpDiffusion,
}

impl From<PriceModelArg> for PriceModel {
    fn from(arg: PriceModelArg) -> Self {
        match arg {
            PriceModelArg::RandomWalk => PriceModel::RandomWalk,
            PriceModelArg::Gbm => PriceModel::Gbm,
            PriceModelArg::JumpDiffusion => PriceModel::JumpDiffusion,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "simulate", about = "Monte Carlo simulation of the vessel protocol")]
struct Cli {
    /// JSON configuration file; missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of periods, including the bootstrap period.
    #[arg(long)]
    n_sim: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Borrower accounts besides the whale.
    #[arg(long)]
    accounts: Option<usize>,

    /// CSV output path.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    price_model: Option<PriceModelArg>,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors.
    #[arg(long)]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> anyhow::Result<SimulationConfig> {
    let mut cfg = match &cli.config {
        Some(path) => SimulationConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    cfg.apply_env_overrides();

    if let Some(n) = cli.n_sim {
        cfg.n_sim = n;
    }
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }
    if let Some(accounts) = cli.accounts {
        cfg.accounts = accounts;
    }
    if let Some(output) = &cli.output {
        cfg.output = output.clone();
    }
    if let Some(model) = cli.price_model {
        cfg.price_path.model = model.into();
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let cfg = build_config(&cli)?;

    println!("=======================================================");
    println!("  Vessel Protocol Simulation");
    println!("  VUSD peg, stability pool and GRVT market");
    println!("=======================================================");
    println!();
    println!("Parameters:");
    println!("  Periods:       {}", cfg.n_sim);
    println!("  Seed:          {}", cfg.seed);
    println!("  Accounts:      {}", cfg.accounts);
    println!("  Price model:   {}", cfg.price_path.model.name());
    println!("  Output:        {}", cfg.output.display());
    println!();
    Expectations::from_config(&cfg).print();
    println!();

    let mut sim = Simulation::new(cfg).context("setting up simulation")?;
    let summary = sim.run_to_file().context("simulation aborted")?;

    println!("=======================================================");
    println!("  Summary");
    println!("=======================================================");
    println!();
    summary.print();
    Ok(())
}
