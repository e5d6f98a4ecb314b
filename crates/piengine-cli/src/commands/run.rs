use super::{colorize_status, describe_error, json_pretty, EXIT_SUCCESS};
use piengine_core::{ConfigLoader, CoreError, Engine, EngineOptions, EngineReport, RunOutcome};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
struct RunSummary<'a> {
    outcome: &'static str,
    ticks: u64,
    report: &'a EngineReport,
}

pub fn run(manifest: &Path, ticks: Option<u64>, no_pace: bool, json: bool) -> Result<u8, String> {
    let loader = ConfigLoader::from_file(manifest).map_err(|e| format!("config error: {e}"))?;
    let engine = Engine::headless();
    engine.initialize(&loader).map_err(|e| describe_error(&e))?;

    let configured = engine.options();
    engine.set_options(EngineOptions {
        max_ticks: ticks.or(configured.max_ticks),
        pace: !no_pace,
        ..configured
    });
    info!("running {} apps from {}", engine.apps().len(), manifest.display());

    let result = engine.run();
    let report = engine.status_report();
    let outcome = settle(result, engine.close())?;

    if json {
        let summary = RunSummary {
            outcome: match outcome {
                RunOutcome::Stopped { .. } => "stopped",
                RunOutcome::TickLimit { .. } => "tick_limit",
            },
            ticks: outcome.ticks(),
            report: &report,
        };
        println!("{}", json_pretty(&summary)?);
    } else {
        match outcome {
            RunOutcome::Stopped { ticks } => println!("stopped after {ticks} ticks"),
            RunOutcome::TickLimit { ticks } => println!("completed {ticks} ticks"),
        }
        print_apps(&report);
    }

    Ok(EXIT_SUCCESS)
}

/// The loop's own failure comes first; a failed teardown is appended to it,
/// or reported alone when the loop ended cleanly.
fn settle(
    result: Result<RunOutcome, CoreError>,
    closed: Result<(), CoreError>,
) -> Result<RunOutcome, String> {
    match (result, closed) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(close)) => Err(format!("shutdown failed: {}", describe_error(&close))),
        (Err(run), Ok(())) => Err(describe_error(&run)),
        (Err(run), Err(close)) => Err(format!(
            "{} (shutdown also failed: {})",
            describe_error(&run),
            describe_error(&close)
        )),
    }
}

fn print_apps(report: &EngineReport) {
    if report.apps.is_empty() {
        println!("no apps loaded");
        return;
    }
    println!("{:<16} {:<6} {:<14} {:<7} PLUGINS", "APP", "KIND", "STATUS", "NODES");
    for app in &report.apps {
        println!(
            "{:<16} {:<6} {:<14} {:<7} {}",
            app.id,
            app.kind,
            colorize_status(app.status),
            app.nodes,
            app.plugins.join(",")
        );
    }
}
