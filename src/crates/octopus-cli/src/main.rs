//! # octopus-cli
//!
//! Command-line runner for a single Señor Octopus pipeline: parse a
//! configuration file, build its graph, and either print a summary of it
//! (`--dry-run`) or drive it until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use octopus_core::config::PipelineConfig;
use octopus_core::dag::build_dag;
use octopus_core::plugin::PluginRegistry;
use octopus_core::scheduler::Scheduler;
use tracing_subscriber::EnvFilter;

/// Run a Señor Octopus pipeline described by a YAML configuration file.
#[derive(Parser)]
#[command(name = "octopus")]
#[command(about = "Run a Senor Octopus event pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the pipeline's YAML configuration file.
    config: PathBuf,

    /// Increase logging verbosity (-v for INFO, -vv for DEBUG).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Parse and print the graph, then exit without running it.
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn print_dry_run(dag: &octopus_core::dag::Dag) {
    let mut names: Vec<&String> = dag.nodes.keys().collect();
    names.sort();
    for name in names {
        let node = &dag.nodes[name];
        if node.children.is_empty() {
            continue;
        }
        let mut children = node.children.clone();
        children.sort();
        println!("{} -> {}", name, children.join(", "));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match PipelineConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut registry = PluginRegistry::new();
    octopus_core::plugins::examples::register(&mut registry);

    let dag = match build_dag(&config, &registry) {
        Ok(dag) => dag,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        print_dry_run(&dag);
        return ExitCode::SUCCESS;
    }

    let scheduler = match Scheduler::new(dag, registry) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let scheduler = std::sync::Arc::new(scheduler);

    let cancel_on_ctrl_c = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_ctrl_c.cancel().await;
        }
    });

    match scheduler.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
