//! Handler registry: maps each job type to a typed deserializer + handler.
//!
//! Each handler registers with its payload struct; the registry deserializes
//! the stored JSON into that struct before invoking the handler, so dispatch
//! happens on the typed variant rather than a stringly switch. Unknown types
//! and malformed payloads surface as handler errors and take the normal
//! fail/retry path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

use super::job::{Job, JobType};
use crate::kernel::ServerDeps;

type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            i64,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<JobType, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type. The handler receives the
    /// deserialized payload, the job id (for audit rows) and the dependency
    /// container.
    pub fn register<P, F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, i64, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, job_id, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value)
                    .map_err(|e| anyhow!("invalid payload for {}: {}", job_type.as_str(), e))?;
                handler(payload, job_id, deps).await
            })
        });
        self.registrations.insert(job_type, boxed);
    }

    /// Deserialize and run a claimed job.
    pub async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<()> {
        let job_type = job
            .typed()
            .ok_or_else(|| anyhow!("unknown job type: {}", job.job_type))?;
        let handler = self
            .registrations
            .get(&job_type)
            .ok_or_else(|| anyhow!("no handler registered for {}", job_type))?;

        handler(job.payload.clone(), job.id, deps).await
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.registrations.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry handle.
pub type SharedJobRegistry = Arc<JobRegistry>;
