//! Per-type job handlers.
//!
//! Each handler is registered with its payload struct and runs against the
//! dependency container: vendor HTTP calls, local mirror upserts and guarded
//! audit rows. Errors bubble to the dispatcher, which converts them into
//! `fail(id, message)` and the retry/dead-letter path.

pub mod consignments;
pub mod customers;
pub mod inventory;
pub mod products;
pub mod sales;
pub mod webhook_event;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use crate::kernel::jobs::{JobRegistry, JobType};
use crate::kernel::settings::keys;
use crate::kernel::ServerDeps;

/// Wire every job type in the closed set to its handler.
pub fn register_handlers(registry: &mut JobRegistry) {
    registry.register(JobType::CreateConsignment, consignments::create_consignment);
    registry.register(JobType::UpdateConsignment, consignments::update_consignment);
    registry.register(JobType::CancelConsignment, consignments::cancel_consignment);
    registry.register(
        JobType::EditConsignmentLines,
        consignments::edit_consignment_lines,
    );
    registry.register(
        JobType::AddConsignmentProducts,
        consignments::add_consignment_products,
    );
    registry.register(
        JobType::MarkTransferPartial,
        consignments::mark_transfer_partial,
    );
    registry.register(JobType::PullConsignments, consignments::pull_consignments);

    registry.register(JobType::PushProductUpdate, products::push_product_update);
    registry.register(JobType::SyncProduct, products::sync_product);
    registry.register(JobType::PullProducts, products::pull_products);

    registry.register(JobType::InventoryCommand, inventory::inventory_command);
    registry.register(JobType::SyncInventory, inventory::sync_inventory);
    registry.register(JobType::PullInventory, inventory::pull_inventory);

    registry.register(JobType::SyncCustomer, customers::sync_customer);
    registry.register(JobType::SyncSale, sales::sync_sale);

    registry.register(JobType::WebhookEvent, webhook_event::handle_webhook_event);
}

// ----------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------

/// Guarded audit insert: failures (including a missing table) never fail the
/// enclosing handler.
pub async fn record_audit(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    action: &str,
    detail: Value,
    job_id: i64,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_audit (entity_type, entity_id, action, detail, job_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(&detail)
    .bind(job_id)
    .execute(pool)
    .await;

    if let Err(e) = result {
        let missing_table = e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "42P01");
        if !missing_table {
            warn!(entity_type, entity_id, action, error = %e, "audit insert failed");
        }
    }
}

/// Poll a vendor resource with exponential backoff until `confirmed` accepts
/// the body or the verification timeout elapses. Used after writes whose
/// effect the vendor applies asynchronously.
pub async fn verify_write<F>(
    deps: &Arc<ServerDeps>,
    path: &str,
    confirmed: F,
) -> Result<Value>
where
    F: Fn(&Value) -> bool,
{
    let timeout_secs = deps
        .settings
        .get_i64(keys::VERIFY_TIMEOUT_SECONDS, 30)
        .await?
        .clamp(1, 600) as u64;
    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut pause = Duration::from_secs(1);

    loop {
        let response = deps.vendor.get(path, &[]).await?;
        if response.is_success() {
            let body = response.json();
            if confirmed(&body) {
                return Ok(body);
            }
        }
        if std::time::Instant::now() + pause > deadline {
            bail!("write not confirmed at {} within {}s", path, timeout_secs);
        }
        tokio::time::sleep(pause).await;
        pause = (pause * 2).min(Duration::from_secs(8));
    }
}

/// Single-key mirror tables written by sync and pull handlers.
#[derive(Debug, Clone, Copy)]
pub enum Mirror {
    Products,
    Customers,
    Sales,
    Consignments,
}

impl Mirror {
    fn table(&self) -> &'static str {
        match self {
            Mirror::Products => "vendor_products",
            Mirror::Customers => "vendor_customers",
            Mirror::Sales => "vendor_sales",
            Mirror::Consignments => "vendor_consignments",
        }
    }
}

pub async fn upsert_mirror(pool: &PgPool, mirror: Mirror, id: &str, data: &Value) -> Result<()> {
    let sql = format!(
        r#"
        INSERT INTO {} (id, data, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
        "#,
        mirror.table()
    );
    sqlx::query(&sql).bind(id).bind(data).execute(pool).await?;
    Ok(())
}

/// Cursor persistence for the periodic pulls. Updates are monotonic in the
/// sense that the stored cursor always reflects the latest page fetched.
pub async fn load_cursor(pool: &PgPool, stream: &str) -> Result<Option<String>> {
    let cursor =
        sqlx::query_scalar::<_, String>("SELECT cursor FROM sync_cursors WHERE stream = $1")
            .bind(stream)
            .fetch_optional(pool)
            .await?;
    Ok(cursor)
}

pub async fn store_cursor(pool: &PgPool, stream: &str, cursor: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (stream, cursor, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (stream) DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = NOW()
        "#,
    )
    .bind(stream)
    .bind(cursor)
    .execute(pool)
    .await?;
    Ok(())
}

/// Pull the vendor's id for an entity out of a response body.
pub fn response_entity_id(body: &Value) -> Option<String> {
    for pointer in ["/data/id", "/id"] {
        match body.pointer(pointer) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Item id within a paginated collection element.
pub fn item_id(item: &Value) -> Option<String> {
    match item.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_entity_id_prefers_nested_data() {
        assert_eq!(
            response_entity_id(&json!({"data": {"id": "c-1"}, "id": "outer"})).as_deref(),
            Some("c-1")
        );
        assert_eq!(response_entity_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(response_entity_id(&json!({})), None);
    }

    #[test]
    fn item_id_reads_strings_and_numbers() {
        assert_eq!(item_id(&json!({"id": "p-1"})).as_deref(), Some("p-1"));
        assert_eq!(item_id(&json!({"id": 9})).as_deref(), Some("9"));
        assert_eq!(item_id(&json!({"sku": "x"})), None);
    }
}
