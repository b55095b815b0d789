//! Watchdog / degrade controller.
//!
//! Periodically inspects queue throughput, webhook intake lag and the
//! circuit breaker, flips safeguards on sustained anomalies and reverses
//! them after a healthy window. Runs in-process every 60 seconds in
//! continuous dispatcher mode; the admin status route exposes the report.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kernel::settings::keys;
use crate::kernel::webhooks::WebhookEvent;
use crate::kernel::ServerDeps;

const DEFAULT_STALE_LOG_SECS: i64 = 900;
const DEFAULT_DEGRADE_PENDING: i64 = 500;
const DEFAULT_HEALTHY_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Banner {
    /// `info`, `warning` or `danger`.
    pub level: String,
    pub message: String,
}

/// Everything the anomaly predicates look at, gathered up front so the
/// trigger logic stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct WatchdogInputs {
    pub pending: i64,
    pub working: i64,
    pub done_last_minute: i64,
    pub last_started_age_secs: Option<i64>,
    pub log_file_age_secs: Option<i64>,
    pub lock_file_age_secs: Option<i64>,
    pub webhook_received_age_secs: Option<i64>,
    pub webhook_processed_age_secs: Option<i64>,
    pub breaker_open: bool,
    pub stale_log_secs: i64,
    pub degrade_pending: i64,
}

#[derive(Debug, Serialize)]
pub struct WatchdogReport {
    pub pending: i64,
    pub working: i64,
    pub done_last_minute: i64,
    pub breaker_open: bool,
    pub anomalies: Vec<&'static str>,
}

/// Anomaly predicates.
pub fn detect_anomalies(inputs: &WatchdogInputs) -> Vec<&'static str> {
    let mut anomalies = Vec::new();

    let file_stale = [inputs.log_file_age_secs, inputs.lock_file_age_secs]
        .iter()
        .any(|age| age.is_some_and(|a| a > inputs.stale_log_secs));
    let nothing_started = inputs
        .last_started_age_secs
        .map(|a| a > inputs.stale_log_secs)
        .unwrap_or(true);
    if inputs.pending > 0 && inputs.done_last_minute == 0 && (file_stale || nothing_started) {
        anomalies.push("queue_stalled");
    }

    if let (Some(received), Some(processed)) = (
        inputs.webhook_received_age_secs,
        inputs.webhook_processed_age_secs,
    ) {
        if received < 86_400 && processed > inputs.stale_log_secs {
            anomalies.push("webhook_backlog");
        }
    }

    if inputs.pending >= inputs.degrade_pending || inputs.breaker_open {
        anomalies.push("degraded");
    }

    anomalies
}

pub struct Watchdog {
    deps: Arc<ServerDeps>,
}

impl Watchdog {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    pub async fn gather(&self) -> Result<WatchdogInputs> {
        let deps = &self.deps;
        let gauges = deps.repo.gauges().await?;
        let (pending, working) = gauges
            .values()
            .fold((0, 0), |(p, w), g| (p + g.pending, w + g.working));

        let now = Utc::now();
        let age = |t: Option<chrono::DateTime<Utc>>| t.map(|t| (now - t).num_seconds());

        let (webhook_received_age, webhook_processed_age) =
            WebhookEvent::intake_ages(deps.repo.pool()).await?;

        Ok(WatchdogInputs {
            pending,
            working,
            done_last_minute: deps.repo.completed_since(now - Duration::minutes(1)).await?,
            last_started_age_secs: age(deps.repo.last_started_at().await?),
            log_file_age_secs: self.file_age(keys::WATCHDOG_LOG_FILE).await,
            lock_file_age_secs: self.file_age(keys::WATCHDOG_LOCK_FILE).await,
            webhook_received_age_secs: webhook_received_age,
            webhook_processed_age_secs: webhook_processed_age,
            breaker_open: deps.vendor.breaker().is_open().await.unwrap_or(false),
            stale_log_secs: deps
                .settings
                .get_i64(keys::WATCHDOG_STALE_LOG_SECONDS, DEFAULT_STALE_LOG_SECS)
                .await?,
            degrade_pending: deps
                .settings
                .get_i64(keys::WATCHDOG_DEGRADE_PENDING, DEFAULT_DEGRADE_PENDING)
                .await?,
        })
    }

    pub async fn report(&self) -> Result<WatchdogReport> {
        let inputs = self.gather().await?;
        let anomalies = detect_anomalies(&inputs);
        Ok(WatchdogReport {
            pending: inputs.pending,
            working: inputs.working,
            done_last_minute: inputs.done_last_minute,
            breaker_open: inputs.breaker_open,
            anomalies,
        })
    }

    /// Evaluate and, with auto-fix enabled, apply or reverse the safeguards.
    pub async fn tick(&self) -> Result<()> {
        let inputs = self.gather().await?;
        let anomalies = detect_anomalies(&inputs);
        let settings = &self.deps.settings;

        if !settings.get_bool(keys::WATCHDOG_AUTO_FIX, false).await? {
            if !anomalies.is_empty() {
                warn!(?anomalies, "watchdog anomalies detected (auto-fix disabled)");
            }
            return Ok(());
        }

        if anomalies.is_empty() {
            let healthy_since = settings.get_i64_fresh(keys::WATCHDOG_HEALTHY_SINCE, 0).await?;
            let now = Utc::now().timestamp();
            if healthy_since == 0 {
                settings.set_i64(keys::WATCHDOG_HEALTHY_SINCE, now).await?;
                return Ok(());
            }
            let healthy_minutes = settings
                .get_i64(keys::WATCHDOG_HEALTHY_MINUTES, DEFAULT_HEALTHY_MINUTES)
                .await?;
            if now - healthy_since >= healthy_minutes * 60 {
                info!("sustained healthy window, reversing safeguards");
                settings.set_bool(keys::FEATURES_HIGH_RISK_DISABLED, false).await?;
                settings.delete(keys::WATCHDOG_BANNER).await?;
                settings.delete(keys::WATCHDOG_HEALTHY_SINCE).await?;
            }
            return Ok(());
        }

        warn!(?anomalies, "watchdog anomalies detected, applying safeguards");
        settings.delete(keys::WATCHDOG_HEALTHY_SINCE).await?;
        settings.set_bool(keys::RUNNER_ENABLED, true).await?;
        settings.set_bool(keys::RUNNER_CONTINUOUS, true).await?;
        settings.set_bool(keys::FEATURES_HIGH_RISK_DISABLED, true).await?;

        let level = if anomalies.contains(&"queue_stalled") || inputs.breaker_open {
            "danger"
        } else {
            "warning"
        };
        settings
            .set_json(
                keys::WATCHDOG_BANNER,
                &Banner {
                    level: level.to_string(),
                    message: format!("queue safeguards active: {}", anomalies.join(", ")),
                },
            )
            .await?;

        if settings.get_bool(keys::WATCHDOG_SPAWN_RUNNER, false).await? {
            spawn_runner_best_effort();
        }
        Ok(())
    }

    async fn file_age(&self, path_key: &str) -> Option<i64> {
        let path = self.deps.settings.get(path_key).await.ok().flatten()?;
        let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
        let secs = mtime.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        Some(Utc::now().timestamp() - secs)
    }
}

/// Spawn a bounded runner as a detached background process. Best effort: the
/// runner binary sits next to the current executable.
pub fn spawn_runner_best_effort() {
    let Ok(current) = std::env::current_exe() else {
        return;
    };
    let runner = current.with_file_name("runner");
    match std::process::Command::new(&runner).arg("--limit=100").spawn() {
        Ok(child) => info!(pid = child.id(), "spawned background runner"),
        Err(e) => warn!(error = %e, runner = %runner.display(), "failed to spawn runner"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_inputs() -> WatchdogInputs {
        WatchdogInputs {
            pending: 3,
            working: 1,
            done_last_minute: 5,
            last_started_age_secs: Some(10),
            webhook_received_age_secs: Some(30),
            webhook_processed_age_secs: Some(35),
            stale_log_secs: DEFAULT_STALE_LOG_SECS,
            degrade_pending: DEFAULT_DEGRADE_PENDING,
            ..Default::default()
        }
    }

    #[test]
    fn healthy_system_raises_nothing() {
        assert!(detect_anomalies(&healthy_inputs()).is_empty());
    }

    #[test]
    fn stall_requires_pending_and_no_completions() {
        let mut inputs = healthy_inputs();
        inputs.done_last_minute = 0;
        inputs.last_started_age_secs = Some(DEFAULT_STALE_LOG_SECS + 1);
        assert!(detect_anomalies(&inputs).contains(&"queue_stalled"));

        // Completions in the last minute clear the stall signal.
        inputs.done_last_minute = 2;
        assert!(!detect_anomalies(&inputs).contains(&"queue_stalled"));

        // An empty queue is not stalled.
        inputs.done_last_minute = 0;
        inputs.pending = 0;
        assert!(!detect_anomalies(&inputs).contains(&"queue_stalled"));
    }

    #[test]
    fn stale_lock_file_counts_as_stall_evidence() {
        let mut inputs = healthy_inputs();
        inputs.done_last_minute = 0;
        inputs.last_started_age_secs = Some(5);
        inputs.lock_file_age_secs = Some(DEFAULT_STALE_LOG_SECS + 100);
        assert!(detect_anomalies(&inputs).contains(&"queue_stalled"));
    }

    #[test]
    fn webhook_backlog_needs_recent_intake() {
        let mut inputs = healthy_inputs();
        inputs.webhook_received_age_secs = Some(120);
        inputs.webhook_processed_age_secs = Some(DEFAULT_STALE_LOG_SECS + 1);
        assert!(detect_anomalies(&inputs).contains(&"webhook_backlog"));

        // Nothing received for a day: the backlog signal is stale noise.
        inputs.webhook_received_age_secs = Some(90_000);
        assert!(!detect_anomalies(&inputs).contains(&"webhook_backlog"));
    }

    #[test]
    fn degrade_on_pending_threshold_or_open_breaker() {
        let mut inputs = healthy_inputs();
        inputs.pending = DEFAULT_DEGRADE_PENDING;
        assert!(detect_anomalies(&inputs).contains(&"degraded"));

        let mut inputs = healthy_inputs();
        inputs.breaker_open = true;
        assert!(detect_anomalies(&inputs).contains(&"degraded"));
    }
}
