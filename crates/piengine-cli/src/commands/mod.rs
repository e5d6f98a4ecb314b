pub mod check;
pub mod plugins;
pub mod run;

use piengine_core::{AppStatus, CoreError};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Renders an engine error; configuration problems get the prefix that
/// `main` maps to [`EXIT_CONFIG_ERROR`].
pub fn describe_error(err: &CoreError) -> String {
    match err.config_error() {
        Some(config) => format!("config error: {config}"),
        None => err.to_string(),
    }
}

pub fn colorize_status(status: AppStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        AppStatus::Running => Style::new().cyan().bold().apply_to(text).to_string(),
        AppStatus::Initialized => Style::new().green().apply_to(text).to_string(),
        AppStatus::Paused => Style::new().yellow().apply_to(text).to_string(),
        AppStatus::Stopped => Style::new().blue().apply_to(text).to_string(),
        AppStatus::Terminated => Style::new().dim().apply_to(text).to_string(),
        AppStatus::Uninitialized => text,
    }
}
