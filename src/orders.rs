//! Order submission from a composed cart.
//!
//! Serialises the cart into the backend's order body and creates, updates,
//! or deletes it through `/api/v1/orders`. Every submission is also kept in
//! `submitted_orders` so the desk can edit or withdraw it later.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{self, ApiTarget};
use crate::cart::{Cart, CartTotals};

const ORDERS_PATH: &str = "/api/v1/orders";

/// Build the order body for `cart`.
pub fn build_order_payload(cart: &Cart, totals: &CartTotals, note: Option<&str>) -> Value {
    let items: Vec<Value> = cart
        .items()
        .iter()
        .map(|item| {
            json!({
                "productId": item.product_id,
                "quantity": item.quantity,
                "unitPrice": item.unit_price,
                "shippingShare": item.shipping_share,
                "points": item.points,
                "separateShipping": item.separate_shipping,
                "subcustomer": item.subcustomer,
            })
        })
        .collect();

    let mut payload = json!({
        "items": items,
        "country": cart.country(),
        "shippingMethod": cart.shipping_method(),
        "currency": totals.currency,
        "totals": {
            "subtotal": totals.subtotal,
            "shipping": totals.shipping,
            "serviceFee": totals.service_fee,
            "grandTotal": totals.grand_total,
            "weight": totals.weight.total_weight,
            "points": totals.points,
            "converted": totals.converted,
        },
    });
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        payload["note"] = Value::String(note.to_string());
    }
    payload
}

/// The backend's id for a created order, from `{"id"}` or `{"data": {"id"}}`.
pub fn extract_remote_id(response: &Value) -> Option<String> {
    let candidate = response.get("data").unwrap_or(response);
    crate::value_str(candidate, &["id", "orderId", "order_id"]).or_else(|| {
        crate::value_i64(candidate, &["id", "orderId", "order_id"]).map(|n| n.to_string())
    })
}

// ---------------------------------------------------------------------------
// Local record
// ---------------------------------------------------------------------------

pub fn record_submission(
    conn: &Connection,
    remote_id: Option<&str>,
    payload: &Value,
    totals: &CartTotals,
) -> Result<String, String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO submitted_orders (id, remote_id, payload, status, grand_total, currency, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'submitted', ?4, ?5, ?6, ?6)",
        params![
            id,
            remote_id,
            payload.to_string(),
            totals.grand_total,
            totals.currency,
            now
        ],
    )
    .map_err(|e| format!("record submitted order: {e}"))?;
    Ok(id)
}

/// Resolve a local or remote order id to the backend id.
pub fn resolve_remote_id(conn: &Connection, order_id: &str) -> Option<String> {
    conn.query_row(
        "SELECT remote_id FROM submitted_orders
         WHERE (id = ?1 OR remote_id = ?1) AND remote_id IS NOT NULL
         LIMIT 1",
        params![order_id],
        |row| row.get::<_, String>(0),
    )
    .ok()
}

pub fn mark_status(conn: &Connection, remote_id: &str, status: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE submitted_orders SET status = ?1, updated_at = ?2 WHERE remote_id = ?3",
        params![status, Utc::now().to_rfc3339(), remote_id],
    )
    .map_err(|e| format!("update submitted order: {e}"))?;
    Ok(())
}

pub fn list_submissions(conn: &Connection, limit: u32) -> Result<Vec<Value>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, remote_id, status, grand_total, currency, created_at, updated_at
             FROM submitted_orders ORDER BY created_at DESC LIMIT ?1",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "remoteId": row.get::<_, Option<String>>(1)?,
                "status": row.get::<_, String>(2)?,
                "grandTotal": row.get::<_, f64>(3)?,
                "currency": row.get::<_, String>(4)?,
                "createdAt": row.get::<_, String>(5)?,
                "updatedAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| e.to_string())?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

// ---------------------------------------------------------------------------
// Backend calls
// ---------------------------------------------------------------------------

pub async fn create_order(target: &ApiTarget, payload: &Value) -> Result<Value, String> {
    let response = api::request(target, "POST", ORDERS_PATH, Some(payload)).await?;
    match extract_remote_id(&response) {
        Some(id) => info!(remote_id = %id, "order created"),
        None => warn!("order created but the response carried no id"),
    }
    Ok(response)
}

pub async fn update_order(
    target: &ApiTarget,
    remote_id: &str,
    payload: &Value,
) -> Result<Value, String> {
    let path = format!("{ORDERS_PATH}/{remote_id}");
    let response = api::request(target, "PUT", &path, Some(payload)).await?;
    info!(remote_id = %remote_id, "order updated");
    Ok(response)
}

pub async fn delete_order(target: &ApiTarget, remote_id: &str) -> Result<Value, String> {
    let path = format!("{ORDERS_PATH}/{remote_id}");
    let response = api::request(target, "DELETE", &path, None).await?;
    info!(remote_id = %remote_id, "order deleted");
    Ok(response)
}
