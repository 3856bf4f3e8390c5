//! Shipping quotes for the order cart.
//!
//! The backend prices shipping for a (country, total weight, product set)
//! tuple and answers with the methods available for it. The cart keeps the
//! last answer per tuple and distributes the selected method's cost across
//! its line items.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{self, ApiTarget};

/// Identifier of the "no shipping" sentinel method.
pub const NO_SHIPPING: &str = "none";

const QUOTE_PATH: &str = "/api/v1/shipping/quote";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingMethod {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Required: a method without a price is never shown as free.
    #[serde(alias = "price", alias = "amount")]
    pub cost: f64,
}

impl ShippingMethod {
    pub fn none() -> Self {
        Self {
            id: NO_SHIPPING.to_string(),
            name: "No shipping".to_string(),
            cost: 0.0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.id == NO_SHIPPING
    }
}

/// What the backend needs to price a shipment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub country: String,
    pub weight: f64,
    pub product_ids: Vec<String>,
}

impl QuoteRequest {
    /// Product ids are deduplicated and sorted so equal carts map to equal keys.
    pub fn new(country: &str, weight: f64, product_ids: impl IntoIterator<Item = String>) -> Self {
        let mut ids: Vec<String> = product_ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self {
            country: country.trim().to_ascii_uppercase(),
            weight,
            product_ids: ids,
        }
    }

    /// Memoisation key: weight is compared at gram precision.
    pub fn cache_key(&self) -> String {
        let grams = (self.weight * 1000.0).round() as i64;
        format!("{}|{}|{}", self.country, grams, self.product_ids.join(","))
    }
}

/// Parse the quote response body into shipping methods.
///
/// Accepts `{"methods": [...]}`, a bare array, or a single `{"cost": n}`
/// object (treated as one method named after its id or "standard").
pub fn parse_quote_response(body: &Value) -> Result<Vec<ShippingMethod>, String> {
    let list = body
        .get("methods")
        .or_else(|| body.get("data"))
        .unwrap_or(body);

    let methods: Vec<ShippingMethod> = match list {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                serde_json::from_value::<ShippingMethod>(item.clone())
                    .map_err(|e| format!("Invalid shipping method in quote: {e}"))
            })
            .collect::<Result<_, _>>()?,
        Value::Object(_) => {
            let cost = crate::value_f64(list, &["cost", "price", "amount"])
                .ok_or_else(|| format!("Unexpected shipping quote response: {list}"))?;
            let id = crate::value_str(list, &["id", "method"]).unwrap_or_else(|| "standard".into());
            vec![ShippingMethod {
                name: crate::value_str(list, &["name"]).unwrap_or_else(|| id.clone()),
                id,
                cost,
            }]
        }
        Value::Null => Vec::new(),
        other => return Err(format!("Unexpected shipping quote response: {other}")),
    };

    for method in &methods {
        if method.id.trim().is_empty() {
            return Err("Shipping method without id in quote".into());
        }
        if !method.cost.is_finite() || method.cost < 0.0 {
            return Err(format!(
                "Invalid cost {} for shipping method {}",
                method.cost, method.id
            ));
        }
    }
    Ok(methods)
}

/// Ask the backend for the methods available for `request`.
pub async fn fetch_quote(
    target: &ApiTarget,
    request: &QuoteRequest,
) -> Result<Vec<ShippingMethod>, String> {
    let body = serde_json::to_value(request).map_err(|e| format!("serialize quote: {e}"))?;
    let response = api::request(target, "POST", QUOTE_PATH, Some(&body))
        .await
        .map_err(|e| {
            warn!(country = %request.country, weight = request.weight, error = %e, "shipping quote failed");
            e
        })?;
    let methods = parse_quote_response(&response)?;
    debug!(
        country = %request.country,
        weight = request.weight,
        methods = methods.len(),
        "shipping quote received"
    );
    Ok(methods)
}

/// Pick the method with `selected_id` from a fresh quote.
///
/// Returns the method plus a user-facing warning when the selection is no
/// longer offered and the sentinel was substituted.
pub fn resolve_selection(
    selected_id: &str,
    methods: &[ShippingMethod],
) -> (ShippingMethod, Option<String>) {
    if selected_id == NO_SHIPPING {
        return (ShippingMethod::none(), None);
    }
    match methods.iter().find(|m| m.id == selected_id) {
        Some(method) => (method.clone(), None),
        None => (
            ShippingMethod::none(),
            Some(format!(
                "Shipping method \"{selected_id}\" is not available for this weight and product set; shipping was reset to none"
            )),
        ),
    }
}
