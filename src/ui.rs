// UI layer: spinner while a run is in progress and the final summary.
// Progress goes to stderr through indicatif; the summary goes to stdout so
// CI scripts can capture the session URL.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::api::{SessionReport, SessionStatus};
use crate::coordinator::RunResult;

/// Start a steady-ticking spinner with `message`. Hidden when stderr is not
/// a terminal, as on most CI runners.
pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// Join a relative `web_url` onto the backend base URL.
pub fn absolute_url(base_url: &str, web_url: &str) -> String {
    if web_url.starts_with("http://") || web_url.starts_with("https://") {
        web_url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            web_url.trim_start_matches('/')
        )
    }
}

/// Lines printed for a finished run.
pub fn summary_lines(base_url: &str, result: &RunResult) -> Vec<String> {
    let mut lines = vec![format!("Session {} is {}", result.session_id, result.status)];
    match (&result.web_url, result.status) {
        (Some(url), _) => lines.push(format!("View results: {}", absolute_url(base_url, url))),
        (None, SessionStatus::Pending) => {
            lines.push("Results are still being processed; no link yet.".to_string())
        }
        (None, _) => {}
    }
    lines
}

pub fn print_run_result(base_url: &str, result: &RunResult) {
    for line in summary_lines(base_url, result) {
        println!("{line}");
    }
}

pub fn print_session_report(base_url: &str, report: &SessionReport) {
    println!("Status: {}", report.status);
    if let Some(url) = &report.web_url {
        println!("View results: {}", absolute_url(base_url, url));
    }
    println!("Files: {}", report.files.len());
}
