//! Product push, sync and pull handlers.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    item_id, load_cursor, record_audit, response_entity_id, store_cursor, upsert_mirror, Mirror,
};
use crate::kernel::ServerDeps;

const PRODUCTS_PATH: &str = "/api/2.0/products";

#[derive(Debug, Serialize, Deserialize)]
pub struct PushProductUpdate {
    /// Vendor product id; absent for create.
    #[serde(default)]
    pub product_id: Option<String>,
    pub fields: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn push_product_update(
    payload: PushProductUpdate,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let (response, action) = match &payload.product_id {
        Some(id) => {
            let path = format!("{}/{}", PRODUCTS_PATH, id);
            (deps.vendor.put_json(&path, &payload.fields, &[]).await?, "update")
        }
        None => {
            // Create: the idempotency header is mandatory. Derive from the
            // SKU when the producer did not supply one.
            let idempotency = match payload.idempotency_key.clone() {
                Some(key) => key,
                None => {
                    let sku = payload
                        .fields
                        .get("sku")
                        .and_then(|v| v.as_str())
                        .context("product create needs an idempotency_key or a sku")?;
                    format!("product:create:{}", sku)
                }
            };
            (
                deps.vendor
                    .post_json(PRODUCTS_PATH, &payload.fields, &[("Idempotency-Key", &idempotency)])
                    .await?,
                "create",
            )
        }
    };

    if !response.is_success() {
        bail!("product push returned {}", response.status);
    }

    let vendor_id = payload
        .product_id
        .clone()
        .or_else(|| response_entity_id(&response.json()))
        .context("product push response carried no id")?;

    record_audit(
        deps.repo.pool(),
        "product",
        &vendor_id,
        action,
        payload.fields,
        job_id,
    )
    .await;
    Ok(())
}

/// Fan-out child of `product.update` webhooks.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncProduct {
    pub entity_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn sync_product(payload: SyncProduct, job_id: i64, deps: Arc<ServerDeps>) -> Result<()> {
    let product_id = payload
        .entity_id
        .context("sync_product payload carried no entity id")?;

    let response = deps
        .vendor
        .get(&format!("{}/{}", PRODUCTS_PATH, product_id), &[])
        .await?;
    if !response.is_success() {
        bail!("product fetch returned {}", response.status);
    }

    let body = response.json();
    let data = body.get("data").cloned().unwrap_or(body);
    upsert_mirror(deps.repo.pool(), Mirror::Products, &product_id, &data).await?;
    record_audit(
        deps.repo.pool(),
        "product",
        &product_id,
        "sync",
        json!({"event_id": payload.event_id}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullProducts {
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn pull_products(
    _payload: PullProducts,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let pool = deps.repo.pool().clone();
    let cursor = load_cursor(&pool, "products").await?;
    let mut pages = deps
        .vendor
        .paginate(PRODUCTS_PATH, &[("deleted", "false")])
        .resume_from(cursor);

    let mut pulled = 0u64;
    while let Some(items) = pages.next_page().await? {
        for item in &items {
            if let Some(id) = item_id(item) {
                upsert_mirror(&pool, Mirror::Products, &id, item).await?;
                pulled += 1;
            }
        }
        if let Some(cursor) = pages.cursor() {
            store_cursor(&pool, "products", cursor).await?;
        }
    }

    record_audit(&pool, "product", "*", "pull", json!({"pulled": pulled}), job_id).await;
    Ok(())
}
