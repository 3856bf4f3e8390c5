use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::{self, ApiTarget};
use crate::{currency, db, diagnostics, settings, storage, value_str, AppState};

#[derive(Debug, PartialEq)]
struct SettingsSetPayload {
    category: String,
    key: String,
    value_node: Value,
}

/// `{category, key, value}` or `{key: "category.key", value}`.
fn parse_settings_set_payload(payload: &Value) -> Result<SettingsSetPayload, String> {
    let mut category = value_str(payload, &["category", "settingType", "setting_type"]);
    let mut key = value_str(payload, &["key", "settingKey", "setting_key"]);

    if category.is_none() {
        if let Some((cat, k)) = key.as_deref().and_then(|k| k.split_once('.')) {
            category = Some(cat.to_string());
            key = Some(k.to_string());
        }
    }

    let value_node = payload
        .get("value")
        .or_else(|| payload.get("settingValue"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(SettingsSetPayload {
        category: category.ok_or("Missing required field: category")?,
        key: key.ok_or("Missing required field: key")?,
        value_node,
    })
}

fn pricing_json(config: &crate::cart::PricingConfig) -> Value {
    json!({
        "boxWeights": config.box_weights.brackets(),
        "serviceFee": config.service_fee,
        "baseCurrency": config.base_currency,
        "secondaryCurrencies": config.secondary_currencies,
    })
}

pub fn settings_get(state: &AppState, payload: Value) -> Result<Value, String> {
    let all = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        db::get_all_settings(&conn)
    };
    let settings = match value_str(&payload, &["category"]) {
        Some(category) => all.get(&category).cloned().unwrap_or_else(|| json!({})),
        None => all,
    };
    let config = state.pricing_config()?;
    Ok(json!({
        "settings": diagnostics::redact_sensitive_fields(settings),
        "pricing": pricing_json(&config),
        "configured": ApiTarget::resolve(&state.db).is_ok(),
    }))
}

pub fn settings_set(state: &AppState, payload: Value) -> Result<Value, String> {
    let parsed = parse_settings_set_payload(&payload)?;
    {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        settings::set_validated(&conn, &parsed.category, &parsed.key, &parsed.value_node)?;
    }
    info!(category = %parsed.category, key = %parsed.key, "setting updated");
    let config = state.pricing_config()?;
    Ok(json!({ "success": true, "pricing": pricing_json(&config) }))
}

/// Store backend credentials in the OS keyring. When the keyring is not
/// usable they go to the `api` settings category instead.
pub fn settings_set_credentials(state: &AppState, payload: Value) -> Result<Value, String> {
    match storage::update_credentials(&payload) {
        Ok(result) => Ok(result),
        Err(e) => {
            let update = storage::parse_credentials_payload(&payload)?;
            warn!(error = %e, "keyring unavailable, storing credentials in local settings");
            let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
            db::set_setting(&conn, settings::CAT_API, storage::KEY_ADMIN_URL, &update.admin_url)?;
            db::set_setting(&conn, settings::CAT_API, storage::KEY_API_KEY, &update.api_key)?;
            Ok(json!({ "success": true, "adminUrl": update.admin_url, "storage": "local" }))
        }
    }
}

/// Forget credentials, pricing settings, cached rates, and open carts.
/// Submitted order records are kept.
pub fn settings_factory_reset(state: &AppState) -> Result<Value, String> {
    if let Err(e) = storage::factory_reset() {
        warn!(error = %e, "keyring reset failed");
    }
    reset_local_state(state)?;
    info!("factory reset completed");
    Ok(json!({ "success": true }))
}

fn reset_local_state(state: &AppState) -> Result<(), String> {
    {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        for category in [settings::CAT_API, settings::CAT_SHIPPING, settings::CAT_CURRENCY] {
            db::delete_all_settings(&conn, category)?;
        }
        conn.execute("DELETE FROM exchange_rates", [])
            .map_err(|e| format!("clear exchange rates: {e}"))?;
    }
    state.carts.lock().map_err(|e| e.to_string())?.clear();
    *state.rates.lock().map_err(|e| e.to_string())? = None;
    Ok(())
}

pub async fn settings_test_connection(state: &AppState) -> Result<Value, String> {
    let target = ApiTarget::resolve(&state.db)?;
    let result = api::test_connectivity(&target).await;
    serde_json::to_value(result).map_err(|e| e.to_string())
}

pub fn app_health(state: &AppState) -> Result<Value, String> {
    diagnostics::health(state)
}

// ---------------------------------------------------------------------------
// Exchange rates
// ---------------------------------------------------------------------------

pub async fn rates_refresh(state: &AppState) -> Result<Value, String> {
    let target = ApiTarget::resolve(&state.db)?;
    let rates = currency::fetch_rates(&target).await?;
    {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        currency::save_rates(&conn, &rates)?;
    }
    info!(base = %rates.base, count = rates.rates.len(), "exchange rates refreshed");
    let view = serde_json::to_value(&rates).map_err(|e| e.to_string())?;
    *state.rates.lock().map_err(|e| e.to_string())? = Some(rates);
    Ok(view)
}

pub fn rates_get(state: &AppState) -> Result<Value, String> {
    match state.rates_snapshot() {
        Some(rates) => serde_json::to_value(rates).map_err(|e| e.to_string()),
        None => Ok(Value::Null),
    }
}
