//! Exchange rates and currency rounding.
//!
//! Totals are computed in the base currency and converted to the secondary
//! currencies with the last-fetched rates. Conversions always round up to
//! the cent so previews never under-quote.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::api::{self, ApiTarget};

const RATES_PATH: &str = "/api/v1/currency/rates";

/// Tolerance absorbing binary float noise before rounding up
/// (e.g. `0.1 * 3.0 * 100.0 == 30.000000000000004`).
const ROUNDING_EPSILON: f64 = 1e-12;

/// Round `value` up to `decimals` places.
pub fn ceil_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let rounded = (scaled - ROUNDING_EPSILON * scaled.abs().max(1.0)).ceil();
    let out = rounded / factor;
    if out == 0.0 {
        0.0
    } else {
        out
    }
}

/// Convert `amount` with `rate`, rounded up to 2 decimal places.
pub fn convert_round_up(amount: f64, rate: f64) -> f64 {
    ceil_to(amount * rate, 2)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRates {
    pub base: String,
    /// Units of each currency per one unit of `base`.
    pub rates: BTreeMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeRates {
    /// Rate converting one unit of `from` into `to`, using cross rates
    /// through the base currency when neither side is the base.
    pub fn rate(&self, from: &str, to: &str) -> Option<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Some(1.0);
        }
        let lookup = |code: &str| -> Option<f64> {
            if code.eq_ignore_ascii_case(&self.base) {
                Some(1.0)
            } else {
                self.rates
                    .get(&code.to_ascii_uppercase())
                    .copied()
                    .filter(|r| r.is_finite() && *r > 0.0)
            }
        };
        Some(lookup(to)? / lookup(from)?)
    }

    /// Convert `amount` of `from` into each of `targets`. Currencies without
    /// a usable rate are reported in the second list.
    pub fn convert_all(
        &self,
        amount: f64,
        from: &str,
        targets: &[String],
    ) -> (BTreeMap<String, f64>, Vec<String>) {
        let mut converted = BTreeMap::new();
        let mut missing = Vec::new();
        for code in targets {
            match self.rate(from, code) {
                Some(rate) => {
                    converted.insert(code.clone(), convert_round_up(amount, rate));
                }
                None => missing.push(code.clone()),
            }
        }
        (converted, missing)
    }
}

/// Parse the rates endpoint body: `{"base": "EUR", "rates": {"USD": 1.08}}`.
pub fn parse_rates_response(body: &Value) -> Result<ExchangeRates, String> {
    let base = crate::value_str(body, &["base", "baseCurrency", "base_currency"])
        .ok_or("Exchange rate response is missing the base currency")?
        .to_ascii_uppercase();
    let raw = body
        .get("rates")
        .and_then(Value::as_object)
        .ok_or("Exchange rate response is missing rates")?;

    let mut rates = BTreeMap::new();
    for (code, value) in raw {
        let rate = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()));
        match rate {
            Some(r) if r.is_finite() && r > 0.0 => {
                rates.insert(code.to_ascii_uppercase(), r);
            }
            _ => warn!(currency = %code, "ignoring unusable exchange rate"),
        }
    }

    Ok(ExchangeRates {
        base,
        rates,
        fetched_at: Utc::now(),
    })
}

pub async fn fetch_rates(target: &ApiTarget) -> Result<ExchangeRates, String> {
    let body = api::request(target, "GET", RATES_PATH, None).await?;
    let rates = parse_rates_response(&body)?;
    info!(base = %rates.base, count = rates.rates.len(), "exchange rates fetched");
    Ok(rates)
}

// ---------------------------------------------------------------------------
// Persistence of the last-fetched rates
// ---------------------------------------------------------------------------

/// Replace the stored rates with `rates`.
pub fn save_rates(conn: &Connection, rates: &ExchangeRates) -> Result<(), String> {
    let fetched_at = rates.fetched_at.to_rfc3339();
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    let result = (|| -> Result<(), String> {
        conn.execute("DELETE FROM exchange_rates", [])
            .map_err(|e| format!("clear exchange_rates: {e}"))?;
        conn.execute(
            "INSERT INTO exchange_rates (currency, rate, base, fetched_at) VALUES (?1, 1.0, ?1, ?2)",
            params![rates.base, fetched_at],
        )
        .map_err(|e| format!("insert base rate: {e}"))?;
        for (code, rate) in &rates.rates {
            if code == &rates.base {
                continue;
            }
            conn.execute(
                "INSERT INTO exchange_rates (currency, rate, base, fetched_at) VALUES (?1, ?2, ?3, ?4)",
                params![code, rate, rates.base, fetched_at],
            )
            .map_err(|e| format!("insert rate {code}: {e}"))?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT")
            .map_err(|e| format!("commit exchange rates: {e}")),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Load the last stored rates, if any.
pub fn load_rates(conn: &Connection) -> Result<Option<ExchangeRates>, String> {
    let mut stmt = conn
        .prepare("SELECT currency, rate, base, fetched_at FROM exchange_rates")
        .map_err(|e| format!("prepare exchange_rates: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| format!("query exchange_rates: {e}"))?;

    let mut base: Option<String> = None;
    let mut fetched_at: Option<DateTime<Utc>> = None;
    let mut rates = BTreeMap::new();
    for (currency, rate, row_base, row_fetched) in rows.filter_map(|r| r.ok()) {
        base.get_or_insert(row_base);
        if fetched_at.is_none() {
            fetched_at = DateTime::parse_from_rfc3339(&row_fetched)
                .ok()
                .map(|d| d.with_timezone(&Utc));
        }
        if Some(&currency) != base.as_ref() {
            rates.insert(currency, rate);
        }
    }

    Ok(base.map(|base| ExchangeRates {
        base,
        rates,
        fetched_at: fetched_at.unwrap_or_else(Utc::now),
    }))
}
