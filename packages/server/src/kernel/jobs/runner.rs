//! Dispatcher: the long-running loop that selects eligible job types under
//! pause flags and concurrency caps, drains claim batches and runs handlers.
//!
//! Two modes: bounded (exit once the processed limit or time budget is
//! reached) and continuous (run until signalled, with idle backoff). Shutdown
//! is cooperative: a termination signal stops further claiming and the
//! current batch finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{JobType, QueueGauge};
use super::registry::SharedJobRegistry;
use crate::kernel::locks;
use crate::kernel::settings::keys;
use crate::kernel::watchdog::Watchdog;
use crate::kernel::ServerDeps;

const BATCH_SIZE: i64 = 50;
const IDLE_BACKOFF_BASE: Duration = Duration::from_millis(500);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded mode: stop after this many processed jobs.
    pub limit: Option<u64>,
    /// Restrict to a single job type.
    pub job_type: Option<JobType>,
    pub continuous: bool,
    /// Bounded mode: stop once this much wall time has elapsed.
    pub time_budget: Option<Duration>,
    pub worker_id: String,
    /// Skip the `runner:{type|all}` startup lock (used when embedded in the
    /// server process alongside an external runner).
    pub skip_startup_lock: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            limit: None,
            job_type: None,
            continuous: false,
            time_budget: None,
            worker_id: format!("runner-{}", Uuid::new_v4()),
            skip_startup_lock: false,
        }
    }
}

/// Final disposition of a dispatcher run, mapped to process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything claimed was completed (or there was nothing to do).
    Clean,
    /// Some items were retried or deferred.
    Partial,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::Partial => 2,
        }
    }
}

/// Per-type eligibility snapshot used by the selection step.
#[derive(Debug, Clone)]
pub struct TypeStat {
    pub job_type: JobType,
    pub paused: bool,
    pub cap: i64,
    pub working: i64,
    pub pending: i64,
}

impl TypeStat {
    pub fn slack(&self) -> i64 {
        (self.cap - self.working).max(0)
    }

    fn eligible(&self) -> bool {
        !self.paused && self.slack() > 0
    }
}

/// Pick the next type to drain: among eligible types ordered by pending
/// descending then slack descending, the first with work waiting; with no
/// pending work anywhere, the first eligible type.
pub fn select_type(explicit: Option<JobType>, stats: &[TypeStat]) -> Option<JobType> {
    if let Some(requested) = explicit {
        return stats
            .iter()
            .find(|s| s.job_type == requested && s.eligible())
            .map(|s| s.job_type);
    }

    let mut ordered: Vec<&TypeStat> = stats.iter().filter(|s| s.eligible()).collect();
    ordered.sort_by(|a, b| {
        b.pending
            .cmp(&a.pending)
            .then(b.slack().cmp(&a.slack()))
    });

    ordered
        .iter()
        .find(|s| s.pending > 0)
        .or_else(|| ordered.first())
        .map(|s| s.job_type)
}

pub struct Dispatcher {
    deps: Arc<ServerDeps>,
    registry: SharedJobRegistry,
    config: DispatcherConfig,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(deps: Arc<ServerDeps>, registry: SharedJobRegistry, config: DispatcherConfig) -> Self {
        Self {
            deps,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for cooperative shutdown; set to true to stop claiming.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Register SIGINT/SIGTERM handlers that flip the shutdown flag.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("termination signal received, finishing current batch");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    /// Run until the limit/time budget is hit (bounded) or a signal arrives
    /// (continuous).
    pub async fn run(self) -> Result<RunOutcome> {
        let lock_name = format!(
            "runner:{}",
            self.config
                .job_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "all".to_string())
        );

        let startup_lock = if self.config.skip_startup_lock {
            None
        } else {
            match locks::try_acquire(self.deps.repo.pool(), &lock_name).await? {
                Some(guard) => Some(guard),
                None => {
                    info!(lock = %lock_name, "another runner holds the lock, exiting");
                    return Ok(RunOutcome::Clean);
                }
            }
        };

        info!(
            worker_id = %self.config.worker_id,
            continuous = self.config.continuous,
            job_type = ?self.config.job_type.map(|t| t.as_str()),
            "dispatcher starting"
        );

        let outcome = self.run_loop().await;

        if let Some(guard) = startup_lock {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "failed to release runner lock");
            }
        }

        info!(worker_id = %self.config.worker_id, outcome = ?outcome, "dispatcher stopped");
        outcome
    }

    async fn run_loop(&self) -> Result<RunOutcome> {
        let started = Instant::now();
        let watchdog = Watchdog::new(self.deps.clone());
        let mut last_watchdog = Instant::now();
        let mut idle_backoff = IDLE_BACKOFF_BASE;
        let mut processed: u64 = 0;
        let mut retried: u64 = 0;

        loop {
            if self.shutting_down() {
                break;
            }
            if let Some(budget) = self.config.time_budget {
                if started.elapsed() >= budget {
                    debug!("time budget expired");
                    break;
                }
            }
            if let Some(limit) = self.config.limit {
                if processed >= limit {
                    break;
                }
            }

            if self
                .deps
                .settings
                .get_bool_fresh(keys::QUEUE_KILL_ALL, false)
                .await
                .unwrap_or(false)
            {
                warn!("queue kill switch is set, stopping");
                break;
            }

            if self.config.continuous && last_watchdog.elapsed() >= WATCHDOG_INTERVAL {
                last_watchdog = Instant::now();
                if let Err(e) = watchdog.tick().await {
                    warn!(error = %e, "watchdog tick failed");
                }
            }

            let stats = self.collect_stats().await?;
            let mut candidates: Vec<JobType> = match select_type(self.config.job_type, &stats) {
                Some(first) => {
                    // With no explicit type, other eligible types are tried
                    // before sleeping if the first claim comes back empty.
                    let mut cs = vec![first];
                    if self.config.job_type.is_none() {
                        cs.extend(
                            stats
                                .iter()
                                .filter(|s| !s.paused && s.slack() > 0 && s.job_type != first)
                                .map(|s| s.job_type),
                        );
                    }
                    cs
                }
                None => Vec::new(),
            };

            let mut batch = Vec::new();
            let mut claimed_type = None;
            for candidate in candidates.drain(..) {
                let stat = stats
                    .iter()
                    .find(|s| s.job_type == candidate)
                    .expect("candidate came from stats");
                let remaining = self
                    .config
                    .limit
                    .map(|l| (l - processed) as i64)
                    .unwrap_or(BATCH_SIZE);
                let take = BATCH_SIZE.min(remaining).min(stat.slack().max(1));
                if take <= 0 {
                    continue;
                }
                let claimed = self.deps.repo.claim_batch(take, Some(candidate)).await?;
                if !claimed.is_empty() {
                    claimed_type = Some(candidate);
                    batch = claimed;
                    break;
                }
            }

            if batch.is_empty() {
                if !self.config.continuous {
                    break;
                }
                tokio::time::sleep(idle_backoff).await;
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_MAX);
                continue;
            }

            debug!(
                count = batch.len(),
                job_type = claimed_type.map(|t| t.as_str()).unwrap_or("?"),
                "claimed batch"
            );

            for job in batch {
                let job_id = job.id;
                let job_type = job.job_type.clone();

                self.deps.repo.heartbeat(job_id).await.ok();
                let result = self.registry.execute(&job, self.deps.clone()).await;
                match result {
                    Ok(()) => {
                        self.deps.repo.heartbeat(job_id).await.ok();
                        self.deps.repo.complete(job_id).await?;
                        processed += 1;
                        idle_backoff = IDLE_BACKOFF_BASE;
                        debug!(job_id, job_type = %job_type, "job completed");
                    }
                    Err(e) => {
                        warn!(job_id, job_type = %job_type, error = %e, "job failed");
                        if let Err(mark_err) =
                            self.deps.repo.fail(job_id, &e.to_string()).await
                        {
                            error!(job_id, error = %mark_err, "failed to record job failure");
                        }
                        retried += 1;
                        processed += 1;
                    }
                }

                if let Some(limit) = self.config.limit {
                    if processed >= limit {
                        break;
                    }
                }
            }
        }

        Ok(if retried > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Clean
        })
    }

    async fn collect_stats(&self) -> Result<Vec<TypeStat>> {
        let gauges = self.deps.repo.gauges().await?;
        let mut stats = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            let gauge = gauges
                .get(job_type.as_str())
                .cloned()
                .unwrap_or_else(QueueGauge::default);
            let paused = self
                .deps
                .settings
                .get_bool_fresh(&keys::pause_flag(job_type.as_str()), false)
                .await?;
            let cap = self
                .deps
                .settings
                .get_i64_fresh(&keys::concurrency_cap(job_type.as_str()), 1)
                .await?
                .clamp(0, 50);
            stats.push(TypeStat {
                job_type,
                paused,
                cap,
                working: gauge.working,
                pending: gauge.pending,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(job_type: JobType, paused: bool, cap: i64, working: i64, pending: i64) -> TypeStat {
        TypeStat {
            job_type,
            paused,
            cap,
            working,
            pending,
        }
    }

    #[test]
    fn selects_highest_pending_eligible_type() {
        let stats = vec![
            stat(JobType::SyncProduct, false, 2, 0, 5),
            stat(JobType::SyncInventory, false, 2, 0, 9),
            stat(JobType::PullProducts, false, 2, 0, 1),
        ];
        assert_eq!(select_type(None, &stats), Some(JobType::SyncInventory));
    }

    #[test]
    fn paused_types_are_skipped() {
        let stats = vec![
            stat(JobType::SyncInventory, true, 2, 0, 9),
            stat(JobType::SyncProduct, false, 2, 0, 5),
        ];
        assert_eq!(select_type(None, &stats), Some(JobType::SyncProduct));
    }

    #[test]
    fn saturated_types_have_no_slack() {
        let stats = vec![
            stat(JobType::SyncInventory, false, 1, 1, 9),
            stat(JobType::SyncProduct, false, 2, 1, 5),
        ];
        assert_eq!(select_type(None, &stats), Some(JobType::SyncProduct));
    }

    #[test]
    fn falls_back_to_slack_when_nothing_pending() {
        let stats = vec![
            stat(JobType::SyncInventory, false, 1, 1, 0),
            stat(JobType::SyncProduct, false, 2, 0, 0),
        ];
        assert_eq!(select_type(None, &stats), Some(JobType::SyncProduct));
    }

    #[test]
    fn explicit_type_enforces_only_its_own_flags() {
        let stats = vec![
            stat(JobType::SyncInventory, false, 2, 0, 9),
            stat(JobType::SyncProduct, false, 2, 0, 0),
        ];
        assert_eq!(
            select_type(Some(JobType::SyncProduct), &stats),
            Some(JobType::SyncProduct)
        );

        let paused = vec![stat(JobType::SyncProduct, true, 2, 0, 5)];
        assert_eq!(select_type(Some(JobType::SyncProduct), &paused), None);
    }

    #[test]
    fn no_candidate_when_everything_paused_or_saturated() {
        let stats = vec![
            stat(JobType::SyncInventory, true, 2, 0, 9),
            stat(JobType::SyncProduct, false, 1, 1, 5),
        ];
        assert_eq!(select_type(None, &stats), None);
    }

    #[test]
    fn run_outcome_maps_to_exit_codes() {
        assert_eq!(RunOutcome::Clean.exit_code(), 0);
        assert_eq!(RunOutcome::Partial.exit_code(), 2);
    }
}
