use typist_core::config::TypistConfig;
use typist_core::fuzzer::Fuzzer;
use typist_core::mutator::MutatorPreset;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Coverage-guided fuzzer for command-line targets",
    long_about = None
)]
struct Cli {
    /// TOML file describing the target and the corpus directories.
    #[clap(value_parser)]
    config_file: PathBuf,
    /// Fix the random seed for a reproducible run.
    #[clap(long)]
    seed: Option<u64>,
    /// Stop after this many seconds.
    #[clap(long)]
    time_limit: Option<u64>,
    /// Stop after this many mutated executions.
    #[clap(long)]
    max_executions: Option<u64>,
    #[clap(long)]
    stop_on_first_crash: bool,
    /// Mutator preset: basic-random, ascii, letters or uppercase.
    #[clap(long)]
    mutator: Option<MutatorPreset>,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = TypistConfig::load_from_file(&cli.config_file)
        .with_context(|| format!("loading configuration from {:?}", cli.config_file))?;

    if let Some(seed) = cli.seed {
        config.fuzzer.seed = Some(seed);
    }
    if let Some(secs) = cli.time_limit {
        config.fuzzer.time_limit_secs = Some(secs);
    }
    if let Some(max) = cli.max_executions {
        config.fuzzer.max_executions = Some(max);
    }
    if cli.stop_on_first_crash {
        config.fuzzer.stop_on_first_crash = true;
    }
    if let Some(preset) = cli.mutator {
        config.fuzzer.mutator = preset;
    }

    let settings = config.prepare().context("preparing fuzzing run")?;
    info!(
        input_dir = %settings.input_dir.display(),
        output_dir = %settings.layout.root.display(),
        "output prepared"
    );

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }

    let mut fuzzer = Fuzzer::from_settings(&settings)?.with_stop_flag(stop);
    fuzzer.initialize(&settings.input_dir)?;
    let summary = fuzzer.run()?;

    println!("Fuzz run finished in {:.2?}.", summary.elapsed);
    println!(
        "Total Executions: {}, Corpus Size: {} ({} discovered), Crashes: {}",
        summary.executions, summary.corpus_size, summary.discovered, summary.crashes
    );
    println!("Results written to {}", settings.layout.root.display());

    Ok(())
}
