//! Inventory command, sync and pull handlers.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;

use super::{load_cursor, record_audit, store_cursor, verify_write};
use crate::kernel::ServerDeps;

const INVENTORY_PATH: &str = "/api/2.0/inventory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryOp {
    /// Set the absolute level.
    Set,
    /// Apply a delta.
    Adjust,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InventoryCommand {
    pub product_id: String,
    pub outlet_id: String,
    pub op: InventoryOp,
    pub count: f64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn inventory_command(
    payload: InventoryCommand,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let idempotency = payload.idempotency_key.clone().unwrap_or_else(|| {
        format!(
            "inventory:{}:{}:{:?}:{}",
            payload.product_id, payload.outlet_id, payload.op, payload.count
        )
    });

    let body = json!({
        "product_id": payload.product_id,
        "outlet_id": payload.outlet_id,
        "action": payload.op,
        "count": payload.count,
    });
    let response = deps
        .vendor
        .post_json(INVENTORY_PATH, &body, &[("Idempotency-Key", &idempotency)])
        .await?;
    if !response.is_success() {
        bail!("inventory command returned {}", response.status);
    }

    // A `set` has a deterministic expected level; verify it landed.
    if payload.op == InventoryOp::Set {
        let expected = payload.count;
        let path = format!(
            "{}?product_id={}&outlet_id={}",
            INVENTORY_PATH, payload.product_id, payload.outlet_id
        );
        let confirmed = verify_write(&deps, &path, |v| level_of(v) == Some(expected)).await?;
        upsert_inventory_mirror(
            deps.repo.pool(),
            &payload.product_id,
            &payload.outlet_id,
            &confirmed,
        )
        .await?;
    }

    record_audit(
        deps.repo.pool(),
        "inventory",
        &format!("{}:{}", payload.product_id, payload.outlet_id),
        "command",
        json!({"op": payload.op, "count": payload.count}),
        job_id,
    )
    .await;
    Ok(())
}

/// Fan-out child of `inventory.update` webhooks.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncInventory {
    pub entity_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn sync_inventory(
    payload: SyncInventory,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let product_id = payload
        .entity_id
        .context("sync_inventory payload carried no entity id")?;

    let response = deps
        .vendor
        .get(&format!("{}?product_id={}", INVENTORY_PATH, product_id), &[])
        .await?;
    if !response.is_success() {
        bail!("inventory fetch returned {}", response.status);
    }

    let body = response.json();
    let records = body
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for record in &records {
        let outlet_id = record
            .get("outlet_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        upsert_inventory_mirror(deps.repo.pool(), &product_id, outlet_id, record).await?;
    }

    record_audit(
        deps.repo.pool(),
        "inventory",
        &product_id,
        "sync",
        json!({"records": records.len(), "event_id": payload.event_id}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullInventory {
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn pull_inventory(
    _payload: PullInventory,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let pool = deps.repo.pool().clone();
    let cursor = load_cursor(&pool, "inventory").await?;
    let mut pages = deps.vendor.paginate(INVENTORY_PATH, &[]).resume_from(cursor);

    let mut pulled = 0u64;
    while let Some(items) = pages.next_page().await? {
        for item in &items {
            let product_id = item.get("product_id").and_then(|v| v.as_str());
            let outlet_id = item.get("outlet_id").and_then(|v| v.as_str());
            if let (Some(product_id), Some(outlet_id)) = (product_id, outlet_id) {
                upsert_inventory_mirror(&pool, product_id, outlet_id, item).await?;
                pulled += 1;
            }
        }
        if let Some(cursor) = pages.cursor() {
            store_cursor(&pool, "inventory", cursor).await?;
        }
    }

    record_audit(&pool, "inventory", "*", "pull", json!({"pulled": pulled}), job_id).await;
    Ok(())
}

async fn upsert_inventory_mirror(
    pool: &PgPool,
    product_id: &str,
    outlet_id: &str,
    data: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vendor_inventory (product_id, outlet_id, data, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (product_id, outlet_id)
        DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
        "#,
    )
    .bind(product_id)
    .bind(outlet_id)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

fn level_of(body: &Value) -> Option<f64> {
    let record = body
        .get("data")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .unwrap_or(body);
    record
        .get("inventory_level")
        .or_else(|| record.get("count"))
        .and_then(|v| v.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_read_from_first_data_record_or_root() {
        assert_eq!(
            level_of(&json!({"data": [{"inventory_level": 12.0}]})),
            Some(12.0)
        );
        assert_eq!(level_of(&json!({"count": 3})), Some(3.0));
        assert_eq!(level_of(&json!({"data": []})), None);
    }
}
