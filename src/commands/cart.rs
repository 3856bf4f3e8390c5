use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{parse_payload, require_cart_id};
use crate::api::ApiTarget;
use crate::cart::{Cart, LineItemInput, LineItemPatch};
use crate::{settings, shipping, value_str, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateItemPayload {
    #[serde(alias = "itemKey", alias = "item_key")]
    key: String,
    #[serde(default, alias = "patch")]
    changes: Option<LineItemPatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportItemsPayload {
    #[serde(default, alias = "lines")]
    items: Vec<LineItemInput>,
    /// Replace the current lines instead of appending.
    #[serde(default)]
    replace: bool,
}

/// `{item: {...}}` or the line fields at the top level.
fn parse_line_input(payload: &Value) -> Result<LineItemInput, String> {
    let node = payload
        .get("item")
        .or_else(|| payload.get("line"))
        .cloned()
        .unwrap_or_else(|| payload.clone());
    parse_payload(node, "cart_add_item")
}

fn parse_update_payload(payload: &Value) -> Result<(String, LineItemPatch), String> {
    let parsed: UpdateItemPayload = parse_payload(payload.clone(), "cart_update_item")?;
    let patch = match parsed.changes {
        Some(p) => p,
        None => parse_payload(payload.clone(), "cart_update_item")?,
    };
    Ok((parsed.key, patch))
}

/// Serialize the cart with its totals; pending warnings are handed over once.
pub(crate) fn cart_view(state: &AppState, cart_id: &str) -> Result<Value, String> {
    let config = state.pricing_config()?;
    let rates = state.rates_snapshot();
    state.with_cart(cart_id, |cart| {
        let totals = cart.totals(&config, rates.as_ref());
        let view = json!({ "cart": cart, "totals": totals });
        cart.take_warnings();
        Ok(view)
    })
}

/// Re-quote shipping for the cart's current weight and country.
///
/// The carts lock is released while the request is in flight; the
/// generation handed out by `begin_quote` discards answers that arrive after
/// a newer recompute started.
pub(crate) async fn refresh_shipping(state: &AppState, cart_id: &str) -> Result<(), String> {
    let config = state.pricing_config()?;
    let pending = state.with_cart(cart_id, |cart| Ok(cart.begin_quote(&config.box_weights)))?;
    let Some((generation, request)) = pending else {
        return Ok(());
    };

    let fetched = match ApiTarget::resolve(&state.db) {
        Ok(target) => shipping::fetch_quote(&target, &request).await,
        Err(e) => Err(e),
    };
    match fetched {
        Ok(methods) => state.with_cart(cart_id, |cart| {
            cart.apply_quote(generation, &request, methods);
            Ok(())
        }),
        Err(e) => {
            warn!(cart_id = %cart_id, error = %e, "shipping recompute failed");
            // The cart may have been closed while the quote was in flight.
            let _ = state.with_cart(cart_id, |cart| {
                cart.fail_quote(generation);
                Ok(())
            });
            Err(e)
        }
    }
}

/// Re-quote after a cart edit has been applied. The edit stands either way,
/// so a failed quote is reported as `shippingError` next to the view instead
/// of failing the command.
async fn view_after_edit(state: &AppState, cart_id: &str) -> Result<Value, String> {
    let shipping_error = refresh_shipping(state, cart_id).await.err();
    let mut view = cart_view(state, cart_id)?;
    if let Some(error) = shipping_error {
        view["shippingError"] = Value::String(error);
    }
    Ok(view)
}

pub async fn cart_open(state: &AppState, payload: Value) -> Result<Value, String> {
    let country = match value_str(&payload, &["country", "countryCode", "country_code"]) {
        Some(c) => Some(c),
        None => {
            let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
            settings::default_country(&conn)
        }
    };
    let mut cart = Cart::new();
    cart.set_country(country.as_deref());
    let cart_id = cart.id.clone();
    {
        let mut carts = state.carts.lock().map_err(|e| e.to_string())?;
        carts.insert(cart_id.clone(), cart);
    }
    info!(cart_id = %cart_id, country = ?country, "cart opened");
    cart_view(state, &cart_id)
}

pub fn cart_close(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let removed = state
        .carts
        .lock()
        .map_err(|e| e.to_string())?
        .remove(&cart_id)
        .is_some();
    if removed {
        info!(cart_id = %cart_id, "cart closed");
    }
    Ok(json!({ "success": true, "closed": removed }))
}

pub fn cart_get(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    cart_view(state, &cart_id)
}

pub async fn cart_add_item(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let input = parse_line_input(&payload)?;
    let key = state.with_cart(&cart_id, |cart| cart.add_item(input).map_err(|e| e.to_string()))?;
    let mut view = view_after_edit(state, &cart_id).await?;
    view["key"] = Value::String(key);
    Ok(view)
}

pub async fn cart_remove_item(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let key = value_str(&payload, &["key", "itemKey", "item_key"])
        .ok_or("Missing required field: key")?;
    let removed = state.with_cart(&cart_id, |cart| Ok(cart.remove_item(&key).is_some()))?;
    if !removed {
        warn!(cart_id = %cart_id, key = %key, "remove of unknown line item ignored");
    }
    view_after_edit(state, &cart_id).await
}

pub async fn cart_update_item(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let (key, patch) = parse_update_payload(&payload)?;
    state.with_cart(&cart_id, |cart| {
        cart.update_item(&key, patch).map_err(|e| e.to_string())
    })?;
    view_after_edit(state, &cart_id).await
}

pub async fn cart_set_country(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let country = value_str(&payload, &["country", "countryCode", "country_code"]);
    state.with_cart(&cart_id, |cart| {
        cart.set_country(country.as_deref());
        Ok(())
    })?;
    view_after_edit(state, &cart_id).await
}

pub fn cart_select_shipping(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let method_id = value_str(&payload, &["methodId", "method_id", "method", "shippingMethod"])
        .unwrap_or_else(|| shipping::NO_SHIPPING.to_string());
    state.with_cart(&cart_id, |cart| {
        cart.select_shipping(&method_id).map_err(|e| e.to_string())
    })?;
    cart_view(state, &cart_id)
}

pub async fn cart_refresh_shipping(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    refresh_shipping(state, &cart_id).await?;
    cart_view(state, &cart_id)
}

/// Add many lines at once (pasted or loaded from a previous order). Either
/// every line is accepted or the cart is left untouched.
pub async fn cart_import_items(state: &AppState, payload: Value) -> Result<Value, String> {
    let cart_id = require_cart_id(&payload)?;
    let parsed: ImportItemsPayload = parse_payload(payload, "cart_import_items")?;
    let count = parsed.items.len();
    state.with_cart(&cart_id, |cart| {
        let mut staged = cart.clone();
        if parsed.replace {
            staged.clear();
        }
        for (idx, input) in parsed.items.into_iter().enumerate() {
            staged
                .add_item(input)
                .map_err(|e| format!("Line {}: {e}", idx + 1))?;
        }
        *cart = staged;
        Ok(())
    })?;
    info!(cart_id = %cart_id, count, "line items imported");
    view_after_edit(state, &cart_id).await
}
