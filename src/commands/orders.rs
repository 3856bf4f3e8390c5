use serde_json::{json, Value};
use tracing::{info, warn};

use super::require_cart_id;
use crate::api::{self, ApiTarget};
use crate::{orders, value_i64, value_str, AppState};

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Build the order body from an open cart, refusing carts that cannot be
/// submitted (empty, no country, unavailable lines).
fn payload_from_cart(
    state: &AppState,
    cart_id: &str,
    note: Option<&str>,
) -> Result<(Value, crate::cart::CartTotals), String> {
    let config = state.pricing_config()?;
    let rates = state.rates_snapshot();
    state.with_cart(cart_id, |cart| {
        cart.ensure_submittable().map_err(|e| e.to_string())?;
        let totals = cart.totals(&config, rates.as_ref());
        Ok((orders::build_order_payload(cart, &totals, note), totals))
    })
}

/// A rejected request whose body names offending fields becomes a normal
/// answer with `fieldErrors`, so the form can mark them inline. Anything
/// else stays an error for the blocking dialog.
fn rejection(error: String) -> Result<Value, String> {
    let field_errors = api::field_errors_from_message(&error);
    if field_errors.is_empty() {
        return Err(error);
    }
    warn!(fields = field_errors.len(), "order rejected by backend validation");
    Ok(json!({ "success": false, "error": error, "fieldErrors": field_errors }))
}

fn require_order_id(payload: &Value) -> Result<String, String> {
    value_str(payload, &["orderId", "order_id", "id"])
        .or_else(|| value_i64(payload, &["orderId", "order_id", "id"]).map(|n| n.to_string()))
        .ok_or_else(|| "Missing required field: orderId".into())
}

/// Remote id for a local or remote order id.
fn remote_id_for(state: &AppState, order_id: &str) -> Result<String, String> {
    let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
    orders::resolve_remote_id(&conn, order_id).ok_or_else(|| format!("Order not found: {order_id}"))
}

pub async fn order_submit(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let note = value_str(&payload, &["note", "comment"]);
    let keep_cart = payload
        .get("keepCart")
        .or_else(|| payload.get("keep_cart"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let (body, totals) = payload_from_cart(state, &cart_id, note.as_deref())?;
    let target = ApiTarget::resolve(&state.db)?;
    let response = match orders::create_order(&target, &body).await {
        Ok(r) => r,
        Err(e) => return rejection(e),
    };

    let remote_id = orders::extract_remote_id(&response);
    let order_id = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        orders::record_submission(&conn, remote_id.as_deref(), &body, &totals)?
    };
    if !keep_cart {
        state.carts.lock().map_err(|e| e.to_string())?.remove(&cart_id);
    }
    info!(order_id = %order_id, remote_id = ?remote_id, grand_total = totals.grand_total, "order submitted");

    Ok(json!({
        "success": true,
        "orderId": order_id,
        "remoteId": remote_id,
        "totals": totals,
    }))
}

/// Replace a submitted order with the contents of an open cart.
pub async fn order_update(state: &AppState, payload: Value) -> Result<Value, String> {
    let order_id = require_order_id(&payload)?;
    let cart_id = require_cart_id(&payload)?;
    let note = value_str(&payload, &["note", "comment"]);

    let remote_id = remote_id_for(state, &order_id)?;
    let (body, totals) = payload_from_cart(state, &cart_id, note.as_deref())?;
    let target = ApiTarget::resolve(&state.db)?;
    if let Err(e) = orders::update_order(&target, &remote_id, &body).await {
        return rejection(e);
    }
    {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        orders::mark_status(&conn, &remote_id, "updated")?;
    }
    Ok(json!({ "success": true, "remoteId": remote_id, "totals": totals }))
}

pub async fn order_delete(state: &AppState, payload: Value) -> Result<Value, String> {
    let order_id = require_order_id(&payload)?;
    let remote_id = remote_id_for(state, &order_id)?;
    let target = ApiTarget::resolve(&state.db)?;
    orders::delete_order(&target, &remote_id).await?;
    {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        orders::mark_status(&conn, &remote_id, "deleted")?;
    }
    Ok(json!({ "success": true, "remoteId": remote_id }))
}

pub fn order_list(state: &AppState, payload: Value) -> Result<Value, String> {
    let limit = value_i64(&payload, &["limit"])
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_LIST_LIMIT);
    let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
    Ok(json!({ "orders": orders::list_submissions(&conn, limit)? }))
}
