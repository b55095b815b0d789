//! Server dependencies (explicitly constructed, injected container).
//!
//! Everything stateful is built once at startup and threaded through an Arc:
//! no process-wide mutable statics. The metrics sink is a trait seam so tests
//! can substitute the in-memory backend.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::kernel::jobs::JobRepo;
use crate::kernel::metrics::{MetricsSink, PgMetricsSink};
use crate::kernel::settings::SettingsStore;
use crate::kernel::vendor::{TokenManager, VendorClient};

#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub settings: Arc<SettingsStore>,
    /// Generic sink used by instrumented code paths.
    pub metrics: Arc<dyn MetricsSink>,
    /// Concrete bucket backend, for the rate limiter and the metrics route.
    pub bucket_metrics: Arc<PgMetricsSink>,
    pub oauth: Arc<TokenManager>,
    pub vendor: Arc<VendorClient>,
    pub repo: Arc<JobRepo>,
}

impl ServerDeps {
    pub fn new(pool: PgPool, config: &Config) -> Result<Self> {
        let settings = Arc::new(SettingsStore::new(pool.clone()));
        let bucket_metrics = Arc::new(PgMetricsSink::new(pool.clone()));
        let metrics: Arc<dyn MetricsSink> = bucket_metrics.clone();
        let oauth = Arc::new(TokenManager::new(pool.clone(), settings.clone(), config));
        let vendor = Arc::new(VendorClient::new(
            config,
            settings.clone(),
            oauth.clone(),
            metrics.clone(),
        )?);
        let repo = Arc::new(JobRepo::new(pool.clone(), settings.clone()));

        Ok(Self {
            db_pool: pool,
            settings,
            metrics,
            bucket_metrics,
            oauth,
            vendor,
            repo,
        })
    }
}
