//! Named JSON commands called by the order-entry frontend.
//!
//! Every handler takes the shared [`AppState`] plus an optional JSON payload
//! and answers `Result<Value, String>`; the error string is shown to the user
//! as-is, so backend failures keep the raw server text.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{value_str, AppState};

pub mod cart;
pub mod orders;
pub mod settings;

/// Every command name accepted by [`invoke`].
pub const COMMANDS: &[&str] = &[
    "cart_open",
    "cart_close",
    "cart_get",
    "cart_add_item",
    "cart_remove_item",
    "cart_update_item",
    "cart_set_country",
    "cart_select_shipping",
    "cart_refresh_shipping",
    "cart_import_items",
    "rates_refresh",
    "rates_get",
    "settings_get",
    "settings_set",
    "settings_set_credentials",
    "settings_factory_reset",
    "settings_test_connection",
    "order_submit",
    "order_update",
    "order_delete",
    "order_list",
    "app_about",
    "app_health",
];

/// Dispatch `command` with `payload`.
pub async fn invoke(state: &AppState, command: &str, payload: Option<Value>) -> Result<Value, String> {
    let payload = payload.unwrap_or(Value::Null);
    debug!(command, "invoke");
    match command {
        "cart_open" => cart::cart_open(state, payload).await,
        "cart_close" => cart::cart_close(state, payload),
        "cart_get" => cart::cart_get(state, payload),
        "cart_add_item" => cart::cart_add_item(state, payload).await,
        "cart_remove_item" => cart::cart_remove_item(state, payload).await,
        "cart_update_item" => cart::cart_update_item(state, payload).await,
        "cart_set_country" => cart::cart_set_country(state, payload).await,
        "cart_select_shipping" => cart::cart_select_shipping(state, payload),
        "cart_refresh_shipping" => cart::cart_refresh_shipping(state, payload).await,
        "cart_import_items" => cart::cart_import_items(state, payload).await,
        "rates_refresh" => settings::rates_refresh(state).await,
        "rates_get" => settings::rates_get(state),
        "settings_get" => settings::settings_get(state, payload),
        "settings_set" => settings::settings_set(state, payload),
        "settings_set_credentials" => settings::settings_set_credentials(state, payload),
        "settings_factory_reset" => settings::settings_factory_reset(state),
        "settings_test_connection" => settings::settings_test_connection(state).await,
        "order_submit" => orders::order_submit(state, payload).await,
        "order_update" => orders::order_update(state, payload).await,
        "order_delete" => orders::order_delete(state, payload).await,
        "order_list" => orders::order_list(state, payload),
        "app_about" => Ok(crate::diagnostics::about_info()),
        "app_health" => settings::app_health(state),
        other => Err(format!("Unknown command: {other}")),
    }
}

/// Deserialize a payload into a typed DTO, naming the command on failure.
pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value, command: &str) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("Invalid {command} payload: {e}"))
}

/// The cart a payload refers to: `{cartId}` or a bare string.
pub(crate) fn require_cart_id(payload: &Value) -> Result<String, String> {
    if let Some(s) = payload.as_str().map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(s.to_string());
    }
    value_str(payload, &["cartId", "cart_id"]).ok_or_else(|| "Missing required field: cartId".into())
}
