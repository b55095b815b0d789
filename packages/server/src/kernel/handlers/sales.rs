//! Sale sync handler (fan-out child of `sale.update` webhooks).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{record_audit, upsert_mirror, Mirror};
use crate::kernel::ServerDeps;

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncSale {
    pub entity_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn sync_sale(payload: SyncSale, job_id: i64, deps: Arc<ServerDeps>) -> Result<()> {
    let sale_id = payload
        .entity_id
        .context("sync_sale payload carried no entity id")?;

    let response = deps
        .vendor
        .get(&format!("/api/2.0/sales/{}", sale_id), &[])
        .await?;
    if !response.is_success() {
        bail!("sale fetch returned {}", response.status);
    }

    let body = response.json();
    let data = body.get("data").cloned().unwrap_or(body);
    upsert_mirror(deps.repo.pool(), Mirror::Sales, &sale_id, &data).await?;
    record_audit(
        deps.repo.pool(),
        "sale",
        &sale_id,
        "sync",
        json!({"event_id": payload.event_id}),
        job_id,
    )
    .await;
    Ok(())
}
