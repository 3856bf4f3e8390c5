//! Pricing configuration stored in `local_settings`.
//!
//! Categories:
//! - `shipping`: `box_weights` (JSON list of `{threshold, boxWeight}`),
//!   `service_fee`, `default_country`
//! - `currency`: `base`, `secondary` (JSON list or comma-separated codes)
//! - `api`: `admin_url`, `api_key` (fallback when the keyring is unavailable)

use rusqlite::Connection;
use serde_json::Value;
use tracing::warn;

use crate::cart::{BoxBracket, BoxWeightTable, PricingConfig};
use crate::db;

pub const CAT_SHIPPING: &str = "shipping";
pub const CAT_CURRENCY: &str = "currency";
pub const CAT_API: &str = "api";

pub const KEY_BOX_WEIGHTS: &str = "box_weights";
pub const KEY_SERVICE_FEE: &str = "service_fee";
pub const KEY_DEFAULT_COUNTRY: &str = "default_country";
pub const KEY_BASE: &str = "base";
pub const KEY_SECONDARY: &str = "secondary";

fn parse_currency_code(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("Invalid currency code: {raw}"));
    }
    Ok(code)
}

fn parse_currency_list(raw: &str) -> Result<Vec<String>, String> {
    let items: Vec<String> = match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    let mut out = Vec::new();
    for item in items {
        let code = parse_currency_code(&item)?;
        if !out.contains(&code) {
            out.push(code);
        }
    }
    Ok(out)
}

pub fn parse_box_weights(raw: &str) -> Result<BoxWeightTable, String> {
    let brackets: Vec<BoxBracket> =
        serde_json::from_str(raw).map_err(|e| format!("Invalid box weight table: {e}"))?;
    BoxWeightTable::new(brackets).map_err(|e| e.to_string())
}

fn parse_service_fee(raw: &str) -> Result<f64, String> {
    let fee: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("Invalid service fee: {raw}"))?;
    if !fee.is_finite() || fee < 0.0 {
        return Err(format!("Invalid service fee: {raw}"));
    }
    Ok(fee)
}

/// Build the pricing configuration. Missing values take defaults; stored
/// values that no longer parse are logged and replaced by defaults.
pub fn load_pricing_config(conn: &Connection) -> PricingConfig {
    let mut config = PricingConfig::default();

    if let Some(raw) = db::get_setting(conn, CAT_SHIPPING, KEY_BOX_WEIGHTS) {
        match parse_box_weights(&raw) {
            Ok(table) => config.box_weights = table,
            Err(e) => warn!(error = %e, "stored box weight table is invalid, using defaults"),
        }
    }
    if let Some(raw) = db::get_setting(conn, CAT_SHIPPING, KEY_SERVICE_FEE) {
        match parse_service_fee(&raw) {
            Ok(fee) => config.service_fee = fee,
            Err(e) => warn!(error = %e, "stored service fee is invalid, using 0"),
        }
    }
    if let Some(raw) = db::get_setting(conn, CAT_CURRENCY, KEY_BASE) {
        match parse_currency_code(&raw) {
            Ok(code) => config.base_currency = code,
            Err(e) => warn!(error = %e, "stored base currency is invalid"),
        }
    }
    if let Some(raw) = db::get_setting(conn, CAT_CURRENCY, KEY_SECONDARY) {
        match parse_currency_list(&raw) {
            Ok(list) => config.secondary_currencies = list,
            Err(e) => warn!(error = %e, "stored secondary currencies are invalid"),
        }
    }
    let base = config.base_currency.clone();
    config.secondary_currencies.retain(|c| c != &base);
    config
}

pub fn default_country(conn: &Connection) -> Option<String> {
    db::get_setting(conn, CAT_SHIPPING, KEY_DEFAULT_COUNTRY)
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
}

fn value_to_settings_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Validate and store one setting. Pricing keys are checked so a bad value
/// never reaches the cart; other keys are stored as given.
pub fn set_validated(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &Value,
) -> Result<(), String> {
    let raw = value_to_settings_string(value);
    let stored = match (category, key) {
        (CAT_SHIPPING, KEY_BOX_WEIGHTS) => {
            let table = parse_box_weights(&raw)?;
            serde_json::to_string(table.brackets())
                .map_err(|e| format!("serialize box weights: {e}"))?
        }
        (CAT_SHIPPING, KEY_SERVICE_FEE) => parse_service_fee(&raw)?.to_string(),
        (CAT_SHIPPING, KEY_DEFAULT_COUNTRY) => raw.trim().to_ascii_uppercase(),
        (CAT_CURRENCY, KEY_BASE) => parse_currency_code(&raw)?,
        (CAT_CURRENCY, KEY_SECONDARY) => {
            let list = parse_currency_list(&raw)?;
            serde_json::to_string(&list).map_err(|e| format!("serialize currencies: {e}"))?
        }
        (CAT_API, crate::storage::KEY_ADMIN_URL) => crate::api::normalize_admin_url(&raw),
        _ => raw,
    };
    db::set_setting(conn, category, key, &stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load_pricing_config(&conn());
        assert_eq!(config, PricingConfig::default());
    }

    #[test]
    fn test_box_weights_roundtrip_through_settings() {
        let conn = conn();
        let value = serde_json::json!(
            r#"[{"threshold": 5, "boxWeight": 0.3}, {"max_weight": 1, "box_weight": 0.1}]"#
        );
        set_validated(&conn, CAT_SHIPPING, KEY_BOX_WEIGHTS, &value).expect("store");
        let config = load_pricing_config(&conn);
        let brackets = config.box_weights.brackets();
        assert_eq!(brackets.len(), 2);
        assert_eq!(brackets[0].threshold, 1.0);
        assert_eq!(config.box_weights.box_weight_for(2.0), 0.3);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let conn = conn();
        let decreasing = serde_json::json!(
            r#"[{"threshold": 1, "boxWeight": 0.5}, {"threshold": 2, "boxWeight": 0.1}]"#
        );
        assert!(set_validated(&conn, CAT_SHIPPING, KEY_BOX_WEIGHTS, &decreasing).is_err());
        assert!(
            set_validated(&conn, CAT_SHIPPING, KEY_SERVICE_FEE, &serde_json::json!("-1")).is_err()
        );
        assert!(set_validated(&conn, CAT_CURRENCY, KEY_BASE, &serde_json::json!("EURO")).is_err());
        assert!(db::get_setting(&conn, CAT_SHIPPING, KEY_BOX_WEIGHTS).is_none());
    }

    #[test]
    fn test_currency_settings() {
        let conn = conn();
        set_validated(&conn, CAT_CURRENCY, KEY_BASE, &serde_json::json!("rub")).expect("base");
        set_validated(
            &conn,
            CAT_CURRENCY,
            KEY_SECONDARY,
            &serde_json::json!("usd, eur, RUB, usd"),
        )
        .expect("secondary");
        set_validated(&conn, CAT_SHIPPING, KEY_SERVICE_FEE, &serde_json::json!(150))
            .expect("fee");

        let config = load_pricing_config(&conn);
        assert_eq!(config.base_currency, "RUB");
        // The base currency is never listed as a secondary one.
        assert_eq!(config.secondary_currencies, vec!["USD", "EUR"]);
        assert_eq!(config.service_fee, 150.0);
    }

    #[test]
    fn test_corrupt_stored_value_falls_back() {
        let conn = conn();
        db::set_setting(&conn, CAT_SHIPPING, KEY_BOX_WEIGHTS, "not json").expect("raw set");
        let config = load_pricing_config(&conn);
        assert_eq!(config.box_weights, BoxWeightTable::default());
    }

    #[test]
    fn test_default_country() {
        let conn = conn();
        assert!(default_country(&conn).is_none());
        set_validated(&conn, CAT_SHIPPING, KEY_DEFAULT_COUNTRY, &serde_json::json!(" kz "))
            .expect("set");
        assert_eq!(default_country(&conn).as_deref(), Some("KZ"));
    }
}
