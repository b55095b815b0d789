//! Queue-handoff processing of persisted webhook events.
//!
//! When inline processing is off, intake enqueues a `webhook.event` job and
//! this handler performs the same fan-out later, off the ACK path.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::debug;

use crate::kernel::webhooks::receiver::WebhookEventJob;
use crate::kernel::webhooks::{process_event, WebhookEvent, WebhookStatus};
use crate::kernel::ServerDeps;

pub async fn handle_webhook_event(
    payload: WebhookEventJob,
    _job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let Some(event) = WebhookEvent::find_by_event_id(deps.repo.pool(), &payload.event_id).await?
    else {
        bail!("webhook event {} not found", payload.event_id);
    };

    if event.status == WebhookStatus::Completed {
        debug!(event_id = %event.event_id, "webhook event already processed");
        return Ok(());
    }

    match process_event(&deps, &event).await {
        Ok(child) => {
            debug!(event_id = %event.event_id, child_job_id = ?child, "webhook event processed");
            Ok(())
        }
        Err(e) => {
            WebhookEvent::mark_failed(deps.repo.pool(), &event.event_id)
                .await
                .ok();
            Err(e)
        }
    }
}
