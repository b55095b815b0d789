//! Consignment lifecycle handlers.
//!
//! Consignments (stock transfers) are the main write path to the vendor.
//! Create-like calls always carry an idempotency header; state-changing
//! writes are verified by polling the resource until the expected state is
//! observed.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    item_id, load_cursor, record_audit, response_entity_id, store_cursor, upsert_mirror,
    verify_write, Mirror,
};
use crate::kernel::ServerDeps;

const CONSIGNMENTS_PATH: &str = "/api/2.0/consignments";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsignmentLine {
    pub product_id: String,
    pub count: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConsignment {
    /// Back-office reference, also the default idempotency scope.
    pub reference: String,
    pub outlet_id: String,
    #[serde(default)]
    pub source_outlet_id: Option<String>,
    #[serde(default)]
    pub products: Vec<ConsignmentLine>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn create_consignment(
    payload: CreateConsignment,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let idempotency = payload
        .idempotency_key
        .clone()
        .unwrap_or_else(|| format!("consignment:{}", payload.reference));

    let body = json!({
        "type": "OUTLET",
        "status": "OPEN",
        "name": payload.reference,
        "outlet_id": payload.outlet_id,
        "source_outlet_id": payload.source_outlet_id,
        "products": payload.products,
    });

    let response = deps
        .vendor
        .post_json(CONSIGNMENTS_PATH, &body, &[("Idempotency-Key", &idempotency)])
        .await?;
    if !response.is_success() {
        bail!("consignment create returned {}", response.status);
    }

    let vendor_id = response_entity_id(&response.json())
        .context("consignment create response carried no id")?;

    let confirmed = verify_write(&deps, &format!("{}/{}", CONSIGNMENTS_PATH, vendor_id), |v| {
        response_entity_id(v).is_some()
    })
    .await?;

    upsert_mirror(deps.repo.pool(), Mirror::Consignments, &vendor_id, &confirmed).await?;
    record_audit(
        deps.repo.pool(),
        "consignment",
        &vendor_id,
        "create",
        json!({"reference": payload.reference, "outlet_id": payload.outlet_id}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateConsignment {
    pub consignment_id: String,
    /// Partial document of fields to change.
    pub fields: Value,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn update_consignment(
    payload: UpdateConsignment,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let path = format!("{}/{}", CONSIGNMENTS_PATH, payload.consignment_id);
    let response = deps.vendor.put_json(&path, &payload.fields, &[]).await?;
    if !response.is_success() {
        bail!("consignment update returned {}", response.status);
    }

    let confirmed = verify_write(&deps, &path, |v| response_entity_id(v).is_some()).await?;
    upsert_mirror(
        deps.repo.pool(),
        Mirror::Consignments,
        &payload.consignment_id,
        &confirmed,
    )
    .await?;
    record_audit(
        deps.repo.pool(),
        "consignment",
        &payload.consignment_id,
        "update",
        payload.fields,
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelConsignment {
    pub consignment_id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn cancel_consignment(
    payload: CancelConsignment,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    set_consignment_status(&deps, &payload.consignment_id, "CANCELLED", job_id).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkTransferPartial {
    pub consignment_id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn mark_transfer_partial(
    payload: MarkTransferPartial,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    set_consignment_status(&deps, &payload.consignment_id, "RECEIVED_PARTIAL", job_id).await
}

async fn set_consignment_status(
    deps: &Arc<ServerDeps>,
    consignment_id: &str,
    status: &str,
    job_id: i64,
) -> Result<()> {
    let path = format!("{}/{}", CONSIGNMENTS_PATH, consignment_id);
    let response = deps
        .vendor
        .patch_json(&path, &json!({"status": status}), &[])
        .await?;
    if !response.is_success() {
        bail!("consignment status change returned {}", response.status);
    }

    let expected = status.to_string();
    let confirmed = verify_write(deps, &path, |v| {
        v.pointer("/data/status")
            .or_else(|| v.get("status"))
            .and_then(|s| s.as_str())
            .is_some_and(|s| s == expected)
    })
    .await?;

    upsert_mirror(deps.repo.pool(), Mirror::Consignments, consignment_id, &confirmed).await?;
    record_audit(
        deps.repo.pool(),
        "consignment",
        consignment_id,
        "status",
        json!({"status": status}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditConsignmentLines {
    pub consignment_id: String,
    pub lines: Vec<ConsignmentLine>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn edit_consignment_lines(
    payload: EditConsignmentLines,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let path = format!("{}/{}/products", CONSIGNMENTS_PATH, payload.consignment_id);
    let response = deps
        .vendor
        .put_json(&path, &json!({"products": payload.lines}), &[])
        .await?;
    if !response.is_success() {
        bail!("consignment line edit returned {}", response.status);
    }

    record_audit(
        deps.repo.pool(),
        "consignment",
        &payload.consignment_id,
        "edit_lines",
        json!({"line_count": payload.lines.len()}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddConsignmentProducts {
    pub consignment_id: String,
    pub products: Vec<ConsignmentLine>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn add_consignment_products(
    payload: AddConsignmentProducts,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let path = format!("{}/{}/products", CONSIGNMENTS_PATH, payload.consignment_id);
    for line in &payload.products {
        // One call per line; the idempotency header makes redelivery safe.
        let idempotency = format!(
            "consignment:{}:product:{}",
            payload.consignment_id, line.product_id
        );
        let response = deps
            .vendor
            .post_json(
                &path,
                &json!({"product_id": line.product_id, "count": line.count}),
                &[("Idempotency-Key", &idempotency)],
            )
            .await?;
        if !response.is_success() {
            bail!(
                "adding product {} returned {}",
                line.product_id,
                response.status
            );
        }
    }

    record_audit(
        deps.repo.pool(),
        "consignment",
        &payload.consignment_id,
        "add_products",
        json!({"count": payload.products.len()}),
        job_id,
    )
    .await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullConsignments {
    #[serde(default)]
    pub trace_id: Option<String>,
}

pub async fn pull_consignments(
    _payload: PullConsignments,
    job_id: i64,
    deps: Arc<ServerDeps>,
) -> Result<()> {
    let pool = deps.repo.pool().clone();
    let cursor = load_cursor(&pool, "consignments").await?;
    let mut pages = deps
        .vendor
        .paginate(CONSIGNMENTS_PATH, &[])
        .resume_from(cursor);

    let mut pulled = 0u64;
    while let Some(items) = pages.next_page().await? {
        for item in &items {
            if let Some(id) = item_id(item) {
                upsert_mirror(&pool, Mirror::Consignments, &id, item).await?;
                pulled += 1;
            }
        }
        if let Some(cursor) = pages.cursor() {
            store_cursor(&pool, "consignments", cursor).await?;
        }
    }

    record_audit(
        &pool,
        "consignment",
        "*",
        "pull",
        json!({"pulled": pulled}),
        job_id,
    )
    .await;
    Ok(())
}
