//! Order Desk - order-entry cart backend.
//!
//! This crate owns the order being composed on the order-entry page: line
//! items, box weights, shipping quotes, and multi-currency totals. The
//! frontend talks to it through named JSON commands (see [`commands::invoke`]),
//! and it talks to the order backend over its REST API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod cart;
pub mod commands;
pub mod currency;
pub mod db;
pub mod diagnostics;
pub mod orders;
pub mod settings;
pub mod shipping;
pub mod storage;

/// State shared by every command.
pub struct AppState {
    pub db: db::DbState,
    /// Open carts by id, one per order-entry view.
    pub carts: Mutex<HashMap<String, cart::Cart>>,
    /// Last-fetched exchange rates.
    pub rates: Mutex<Option<currency::ExchangeRates>>,
}

impl AppState {
    /// Wrap an initialised database, reloading the last stored rates.
    pub fn new(db: db::DbState) -> Self {
        let rates = db
            .conn
            .lock()
            .ok()
            .and_then(|conn| currency::load_rates(&conn).ok().flatten());
        if let Some(r) = rates.as_ref() {
            info!(base = %r.base, fetched_at = %r.fetched_at, "loaded stored exchange rates");
        }
        Self {
            db,
            carts: Mutex::new(HashMap::new()),
            rates: Mutex::new(rates),
        }
    }

    /// Open (or create) the database under `data_dir` and build the state.
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        Ok(Self::new(db::init(data_dir)?))
    }

    pub fn pricing_config(&self) -> Result<cart::PricingConfig, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        Ok(settings::load_pricing_config(&conn))
    }

    pub fn rates_snapshot(&self) -> Option<currency::ExchangeRates> {
        self.rates.lock().ok().and_then(|r| r.clone())
    }

    /// Run `f` against the open cart `cart_id`.
    pub fn with_cart<T>(
        &self,
        cart_id: &str,
        f: impl FnOnce(&mut cart::Cart) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut carts = self.carts.lock().map_err(|e| e.to_string())?;
        let cart = carts
            .get_mut(cart_id)
            .ok_or_else(|| format!("Cart not found: {cart_id}"))?;
        f(cart)
    }
}

// ---------------------------------------------------------------------------
// JSON payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize structured logging (console + daily rolling file).
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
pub fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_desk_lib=debug"));

    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "order-desk");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_target(true);
    // Console goes to stderr: stdout carries the command bridge.
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Starting Order Desk v{}", env!("CARGO_PKG_VERSION"));
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_helpers() {
        let v = serde_json::json!({ "a": "  x ", "b": "", "n": 2.5, "i": 7 });
        assert_eq!(value_str(&v, &["b", "a"]).as_deref(), Some("x"));
        assert!(value_str(&v, &["missing"]).is_none());
        assert_eq!(value_f64(&v, &["n"]), Some(2.5));
        assert_eq!(value_i64(&v, &["n", "i"]), Some(7));
    }

    #[test]
    fn test_app_state_reloads_rates() {
        let db = db::init_in_memory();
        {
            let conn = db.conn.lock().expect("lock");
            let rates = currency::ExchangeRates {
                base: "EUR".into(),
                rates: std::collections::BTreeMap::from([("USD".to_string(), 1.1)]),
                fetched_at: chrono::Utc::now(),
            };
            currency::save_rates(&conn, &rates).expect("save");
        }
        let state = AppState::new(db);
        let rates = state.rates_snapshot().expect("rates loaded");
        assert_eq!(rates.rates.get("USD"), Some(&1.1));
        assert!(state.with_cart("nope", |_| Ok(())).is_err());
    }
}
