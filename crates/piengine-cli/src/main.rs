mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE};
use piengine_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "piengine",
    version,
    about = "Drive scene apps and plugins through a fixed-step engine loop"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a manifest and run the engine loop until stopped.
    Run {
        /// Path to the engine manifest.
        #[arg(default_value = "engine.toml")]
        manifest: PathBuf,
        /// Stop after this many ticks (overrides `engine.max_ticks`).
        #[arg(long)]
        ticks: Option<u64>,
        /// Tick as fast as possible instead of once per frame.
        #[arg(long, default_value_t = false)]
        no_pace: bool,
    },
    /// Validate a manifest and every scene it references.
    Check {
        /// Path to the engine manifest.
        #[arg(default_value = "engine.toml")]
        manifest: PathBuf,
    },
    /// List the plugins that manifests can refer to by name.
    Plugins,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PIENGINE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Run {
            manifest,
            ticks,
            no_pace,
        } => commands::run::run(&manifest, ticks, no_pace, json_output),
        Commands::Check { manifest } => commands::check::run(&manifest, json_output),
        Commands::Plugins => commands::plugins::run(json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
