use crate::cluster::ClusterApi;
use crate::poll::poll_until;
use e2e_model::constants::LOG_MARKER;
use e2e_model::{PollPolicy, Settings};
use log::{info, warn};
use std::ops::ControlFlow;
use std::time::Duration;

/// The last line of `logs` that contains `marker`.
pub fn latest_line_containing<'a>(logs: &'a str, marker: &str) -> Option<&'a str> {
    logs.lines().rev().find(|line| line.contains(marker))
}

/// Waits until the latest `retrieving profiles` line of the controller pods contains `needle`.
/// Only the most recent reconciliation counts, so an older line listing `needle` does not
/// satisfy the wait once a newer one no longer does.
pub async fn wait_for_log<C>(
    cluster: &C,
    settings: &Settings,
    needle: &str,
    max_wait: Duration,
) -> bool
where
    C: ClusterApi,
{
    info!(
        "Waiting for logs to contain: '{}' (max {}s)...",
        needle,
        max_wait.as_secs()
    );
    let policy = PollPolicy::new(settings.timeouts.log_interval, max_wait);
    let found = poll_until(&policy, move || async move {
        let logs = match cluster
            .logs(
                &settings.target_namespace,
                &settings.label_selector,
                settings.log_tail_lines,
            )
            .await
        {
            Ok(logs) => logs,
            Err(e) => return ControlFlow::Continue(e.to_string()),
        };
        match latest_line_containing(&logs, LOG_MARKER) {
            Some(line) if line.contains(needle) => ControlFlow::Break(line.to_string()),
            Some(line) => ControlFlow::Continue(line.to_string()),
            None => ControlFlow::Continue(format!("no '{}' line yet", LOG_MARKER)),
        }
    })
    .await;
    match found {
        Ok((line, elapsed)) => {
            info!("Found: {} after {}s ({})", needle, elapsed.as_secs(), line.trim());
            true
        }
        Err(exhausted) => {
            warn!(
                "Substring '{}' not found after {}s (last: {})",
                needle,
                max_wait.as_secs(),
                exhausted.last.unwrap_or_default().trim()
            );
            false
        }
    }
}

/// Logs the most recent controller log lines.
pub async fn show_logs<C>(cluster: &C, settings: &Settings, tail_lines: i64)
where
    C: ClusterApi,
{
    info!("Recent logs (last {} lines):", tail_lines);
    match cluster
        .logs(&settings.target_namespace, &settings.label_selector, tail_lines)
        .await
    {
        Ok(logs) => {
            for line in logs.lines() {
                info!("  {}", line);
            }
        }
        Err(e) => warn!("Unable to read controller logs: {}", e),
    }
}
