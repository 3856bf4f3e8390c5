//! Order cart calculator.
//!
//! Holds the line items of an order being composed and keeps weight,
//! shipping, and totals consistent with them:
//!
//! - **Weight**: Σ `weight * quantity`, plus a carton ("box") weight picked
//!   from a bracket table by the combined item weight. Lines flagged
//!   `separate_shipping` travel in their own carton.
//! - **Shipping**: the selected method's quoted cost is split across lines
//!   proportional to line weight, each share rounded up to a whole unit.
//!   A weightless cart splits evenly by line count.
//! - **Totals**: subtotal + shipping + service fee, converted to secondary
//!   currencies and rounded up to the cent.
//!
//! A cart lives only as long as the order-entry view that opened it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::currency::{ceil_to, ExchangeRates};
use crate::shipping::{self, QuoteRequest, ShippingMethod, NO_SHIPPING};

#[derive(Debug, Error, PartialEq)]
pub enum CartError {
    #[error("Line item not found: {0}")]
    UnknownItem(String),
    #[error("Missing productId")]
    MissingProduct,
    #[error("Quantity must be at least 1")]
    InvalidQuantity,
    #[error("Invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: f64 },
    #[error("Invalid box weight table: {0}")]
    InvalidBoxTable(String),
    #[error("Shipping method not offered for this cart: {0}")]
    UnknownShippingMethod(String),
    #[error("Cart is empty")]
    Empty,
    #[error("Cart has unavailable items: {}", .0.join(", "))]
    Unavailable(Vec<String>),
    #[error("Shipping country is not set")]
    MissingCountry,
}

fn check_amount(field: &'static str, value: f64) -> Result<f64, CartError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(CartError::InvalidNumber { field, value })
    }
}

// ---------------------------------------------------------------------------
// Box weight brackets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxBracket {
    /// Exclusive upper bound of item weight served by this carton.
    #[serde(alias = "maxWeight", alias = "max_weight")]
    pub threshold: f64,
    #[serde(alias = "box_weight", alias = "weight")]
    pub box_weight: f64,
}

/// Step function from item weight to carton weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoxWeightTable {
    brackets: Vec<BoxBracket>,
}

impl BoxWeightTable {
    /// Build a table. Brackets are sorted by threshold; thresholds must be
    /// distinct and positive, and a larger threshold may not map to a lighter
    /// carton.
    pub fn new(mut brackets: Vec<BoxBracket>) -> Result<Self, CartError> {
        for b in &brackets {
            if !b.threshold.is_finite() || b.threshold <= 0.0 {
                return Err(CartError::InvalidBoxTable(format!(
                    "threshold {} must be positive",
                    b.threshold
                )));
            }
            if !b.box_weight.is_finite() || b.box_weight < 0.0 {
                return Err(CartError::InvalidBoxTable(format!(
                    "box weight {} must be non-negative",
                    b.box_weight
                )));
            }
        }
        brackets.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));
        for pair in brackets.windows(2) {
            if pair[0].threshold == pair[1].threshold {
                return Err(CartError::InvalidBoxTable(format!(
                    "duplicate threshold {}",
                    pair[0].threshold
                )));
            }
            if pair[1].box_weight < pair[0].box_weight {
                return Err(CartError::InvalidBoxTable(format!(
                    "box weight decreases from {} to {} at threshold {}",
                    pair[0].box_weight, pair[1].box_weight, pair[1].threshold
                )));
            }
        }
        Ok(Self { brackets })
    }

    pub fn brackets(&self) -> &[BoxBracket] {
        &self.brackets
    }

    /// Carton weight for `item_weight`: the bracket with the smallest
    /// threshold strictly greater than the weight. Scans from the largest
    /// threshold down; weights beyond every threshold take the largest carton.
    pub fn box_weight_for(&self, item_weight: f64) -> f64 {
        if item_weight <= 0.0 {
            return 0.0;
        }
        let Some(largest) = self.brackets.last() else {
            return 0.0;
        };
        let mut selected = largest.box_weight;
        for bracket in self.brackets.iter().rev() {
            if bracket.threshold > item_weight {
                selected = bracket.box_weight;
            } else {
                break;
            }
        }
        selected
    }
}

impl Default for BoxWeightTable {
    fn default() -> Self {
        let brackets = [
            (0.5, 0.1),
            (1.0, 0.15),
            (2.0, 0.25),
            (5.0, 0.4),
            (10.0, 0.7),
            (20.0, 1.2),
            (30.0, 1.6),
        ]
        .into_iter()
        .map(|(threshold, box_weight)| BoxBracket {
            threshold,
            box_weight,
        })
        .collect();
        Self { brackets }
    }
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub key: String,
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: f64,
    /// Weight of one unit.
    pub weight: f64,
    /// Network points of one unit.
    pub points: f64,
    pub available: bool,
    pub separate_shipping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcustomer: Option<String>,
    /// This line's part of the shipping cost.
    pub shipping_share: f64,
}

impl LineItem {
    pub fn line_weight(&self) -> f64 {
        self.weight * f64::from(self.quantity)
    }

    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }

    pub fn line_points(&self) -> f64 {
        self.points * f64::from(self.quantity)
    }
}

/// Fields of a new line item as sent by the order-entry form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemInput {
    #[serde(alias = "product_id", alias = "product")]
    pub product_id: String,
    #[serde(default = "default_quantity", alias = "qty")]
    pub quantity: u32,
    #[serde(default, alias = "unit_price", alias = "price")]
    pub unit_price: f64,
    #[serde(default)]
    pub weight: f64,
    #[serde(default, alias = "pv")]
    pub points: f64,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default, alias = "separate_shipping")]
    pub separate_shipping: bool,
    #[serde(default)]
    pub subcustomer: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

fn default_available() -> bool {
    true
}

/// Partial update of a line item; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemPatch {
    #[serde(default, alias = "product_id", alias = "product")]
    pub product_id: Option<String>,
    #[serde(default, alias = "qty")]
    pub quantity: Option<u32>,
    #[serde(default, alias = "unit_price", alias = "price")]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default, alias = "pv")]
    pub points: Option<f64>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default, alias = "separate_shipping")]
    pub separate_shipping: Option<bool>,
    /// `Some("")` clears the subcustomer.
    #[serde(default)]
    pub subcustomer: Option<String>,
}

fn normalize_subcustomer(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Weight and shipping arithmetic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightSummary {
    pub item_weight: f64,
    pub box_weight: f64,
    pub total_weight: f64,
}

/// Item weight plus carton weight. Lines with `separate_shipping` each get
/// their own carton sized by that line's weight.
pub fn compute_weight(items: &[LineItem], table: &BoxWeightTable) -> WeightSummary {
    let mut combined = 0.0;
    let mut separate = 0.0;
    let mut box_weight = 0.0;
    for item in items {
        if item.separate_shipping {
            separate += item.line_weight();
            box_weight += table.box_weight_for(item.line_weight());
        } else {
            combined += item.line_weight();
        }
    }
    box_weight += table.box_weight_for(combined);
    let item_weight = combined + separate;
    WeightSummary {
        item_weight,
        box_weight,
        total_weight: item_weight + box_weight,
    }
}

/// Split `cost` across lines by their weight, rounding every share up to a
/// whole unit. With zero total weight each line gets `ceil(cost / n)`.
pub fn distribute_shipping(cost: f64, line_weights: &[f64]) -> Vec<f64> {
    if line_weights.is_empty() {
        return Vec::new();
    }
    if cost <= 0.0 {
        return vec![0.0; line_weights.len()];
    }
    let total: f64 = line_weights.iter().sum();
    if total <= 0.0 {
        let share = ceil_to(cost / line_weights.len() as f64, 0);
        return vec![share; line_weights.len()];
    }
    line_weights
        .iter()
        .map(|w| ceil_to(cost * w / total, 0))
        .collect()
}

// ---------------------------------------------------------------------------
// Pricing configuration and totals
// ---------------------------------------------------------------------------

/// Inputs to totals that come from settings rather than from the cart.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingConfig {
    pub box_weights: BoxWeightTable,
    /// Fixed fee added to every non-empty order, in the base currency.
    pub service_fee: f64,
    pub base_currency: String,
    pub secondary_currencies: Vec<String>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            box_weights: BoxWeightTable::default(),
            service_fee: 0.0,
            base_currency: "EUR".to_string(),
            secondary_currencies: vec!["USD".to_string(), "RUB".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub item_count: usize,
    pub subtotal: f64,
    #[serde(flatten)]
    pub weight: WeightSummary,
    pub shipping_method: String,
    /// Cost quoted for the selected method.
    pub quoted_shipping: f64,
    /// Σ of per-line shares; what the order is charged.
    pub shipping: f64,
    pub service_fee: f64,
    pub grand_total: f64,
    pub points: f64,
    pub currency: String,
    /// Grand total in each secondary currency.
    pub converted: BTreeMap<String, f64>,
    pub by_subcustomer: BTreeMap<String, f64>,
    pub unavailable: Vec<String>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: String,
    items: Vec<LineItem>,
    country: Option<String>,
    shipping_method: String,
    quoted_cost: f64,
    methods: Vec<ShippingMethod>,
    #[serde(skip)]
    quote_generation: u64,
    #[serde(skip)]
    quote_cache: HashMap<String, Vec<ShippingMethod>>,
    warnings: Vec<String>,
    created_at: DateTime<Utc>,
}

impl Default for Cart {
    fn default() -> Self {
        Self::new()
    }
}

impl Cart {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            items: Vec::new(),
            country: None,
            shipping_method: NO_SHIPPING.to_string(),
            quoted_cost: 0.0,
            methods: Vec::new(),
            quote_generation: 0,
            quote_cache: HashMap::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn item(&self, key: &str) -> Option<&LineItem> {
        self.items.iter().find(|i| i.key == key)
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn shipping_method(&self) -> &str {
        &self.shipping_method
    }

    pub fn methods(&self) -> &[ShippingMethod] {
        &self.methods
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Drop warnings once the frontend has shown them.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Insert a new line under a fresh key and return the key.
    pub fn add_item(&mut self, input: LineItemInput) -> Result<String, CartError> {
        let product_id = input.product_id.trim().to_string();
        if product_id.is_empty() {
            return Err(CartError::MissingProduct);
        }
        if input.quantity == 0 {
            return Err(CartError::InvalidQuantity);
        }
        let item = LineItem {
            key: Uuid::new_v4().to_string(),
            product_id,
            quantity: input.quantity,
            unit_price: check_amount("unitPrice", input.unit_price)?,
            weight: check_amount("weight", input.weight)?,
            points: check_amount("points", input.points)?,
            available: input.available,
            separate_shipping: input.separate_shipping,
            subcustomer: normalize_subcustomer(input.subcustomer),
            shipping_share: 0.0,
        };
        let key = item.key.clone();
        debug!(cart_id = %self.id, key = %key, product_id = %item.product_id, "line item added");
        self.items.push(item);
        self.redistribute();
        Ok(key)
    }

    /// Remove a line. Unknown keys are ignored; the cart is recomputed either
    /// way since absent rows already count as zero.
    pub fn remove_item(&mut self, key: &str) -> Option<LineItem> {
        let removed = self
            .items
            .iter()
            .position(|i| i.key == key)
            .map(|idx| self.items.remove(idx));
        self.redistribute();
        removed
    }

    /// Apply `patch` to an existing line.
    pub fn update_item(&mut self, key: &str, patch: LineItemPatch) -> Result<(), CartError> {
        let idx = self
            .items
            .iter()
            .position(|i| i.key == key)
            .ok_or_else(|| CartError::UnknownItem(key.to_string()))?;

        // Validate everything before touching the line.
        let product_id = match patch.product_id {
            Some(p) if p.trim().is_empty() => return Err(CartError::MissingProduct),
            Some(p) => Some(p.trim().to_string()),
            None => None,
        };
        if patch.quantity == Some(0) {
            return Err(CartError::InvalidQuantity);
        }
        let unit_price = patch
            .unit_price
            .map(|v| check_amount("unitPrice", v))
            .transpose()?;
        let weight = patch.weight.map(|v| check_amount("weight", v)).transpose()?;
        let points = patch.points.map(|v| check_amount("points", v)).transpose()?;

        let item = &mut self.items[idx];
        if let Some(p) = product_id {
            item.product_id = p;
        }
        if let Some(q) = patch.quantity {
            item.quantity = q;
        }
        if let Some(v) = unit_price {
            item.unit_price = v;
        }
        if let Some(v) = weight {
            item.weight = v;
        }
        if let Some(v) = points {
            item.points = v;
        }
        if let Some(v) = patch.available {
            item.available = v;
        }
        if let Some(v) = patch.separate_shipping {
            item.separate_shipping = v;
        }
        if patch.subcustomer.is_some() {
            item.subcustomer = normalize_subcustomer(patch.subcustomer);
        }
        self.redistribute();
        Ok(())
    }

    pub fn set_country(&mut self, country: Option<&str>) {
        self.country = country
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty());
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.redistribute();
    }

    pub fn weight(&self, table: &BoxWeightTable) -> WeightSummary {
        compute_weight(&self.items, table)
    }

    /// The quote this cart currently needs, if it can be priced at all.
    pub fn quote_request(&self, table: &BoxWeightTable) -> Option<QuoteRequest> {
        let country = self.country.as_deref()?;
        if self.items.is_empty() {
            return None;
        }
        let weight = self.weight(table).total_weight;
        Some(QuoteRequest::new(
            country,
            weight,
            self.items.iter().map(|i| i.product_id.clone()),
        ))
    }

    /// Start a shipping recompute.
    ///
    /// Returns `None` when nothing needs fetching: the cart cannot be priced
    /// (no country or no items, shipping drops to the sentinel) or the tuple
    /// was quoted before (the memoised methods are applied immediately).
    /// Otherwise returns the generation to hand back to [`Cart::apply_quote`].
    pub fn begin_quote(&mut self, table: &BoxWeightTable) -> Option<(u64, QuoteRequest)> {
        self.quote_generation += 1;
        let Some(request) = self.quote_request(table) else {
            self.methods.clear();
            self.shipping_method = NO_SHIPPING.to_string();
            self.quoted_cost = 0.0;
            self.redistribute();
            return None;
        };
        if let Some(methods) = self.quote_cache.get(&request.cache_key()).cloned() {
            debug!(cart_id = %self.id, key = %request.cache_key(), "shipping quote cache hit");
            self.methods = methods;
            self.select_from_quote();
            return None;
        }
        Some((self.quote_generation, request))
    }

    /// Apply a quote fetched for `generation`. Quotes from superseded
    /// generations are dropped and `false` is returned.
    pub fn apply_quote(
        &mut self,
        generation: u64,
        request: &QuoteRequest,
        methods: Vec<ShippingMethod>,
    ) -> bool {
        self.quote_cache
            .insert(request.cache_key(), methods.clone());
        if generation != self.quote_generation {
            debug!(
                cart_id = %self.id,
                generation,
                current = self.quote_generation,
                "discarding stale shipping quote"
            );
            return false;
        }
        self.methods = methods;
        self.select_from_quote();
        true
    }

    /// A quote for `generation` failed: never keep pricing a different
    /// weight, so shipping drops to the sentinel until the next quote.
    pub fn fail_quote(&mut self, generation: u64) {
        if generation != self.quote_generation {
            return;
        }
        if self.shipping_method != NO_SHIPPING {
            warn!(cart_id = %self.id, method = %self.shipping_method, "shipping quote failed, selection dropped");
            self.warnings.push(format!(
                "Shipping could not be quoted; \"{}\" was reset to no shipping",
                self.shipping_method
            ));
        }
        self.methods.clear();
        self.shipping_method = NO_SHIPPING.to_string();
        self.quoted_cost = 0.0;
        self.redistribute();
    }

    /// User picks a method from the last quote (or the sentinel).
    pub fn select_shipping(&mut self, method_id: &str) -> Result<(), CartError> {
        let method_id = method_id.trim();
        if method_id == NO_SHIPPING || method_id.is_empty() {
            self.shipping_method = NO_SHIPPING.to_string();
            self.quoted_cost = 0.0;
        } else {
            let method = self
                .methods
                .iter()
                .find(|m| m.id == method_id)
                .ok_or_else(|| CartError::UnknownShippingMethod(method_id.to_string()))?;
            self.shipping_method = method.id.clone();
            self.quoted_cost = method.cost;
        }
        info!(cart_id = %self.id, method = %self.shipping_method, cost = self.quoted_cost, "shipping method selected");
        self.redistribute();
        Ok(())
    }

    fn select_from_quote(&mut self) {
        let (method, warning) = shipping::resolve_selection(&self.shipping_method, &self.methods);
        if let Some(message) = warning {
            warn!(cart_id = %self.id, method = %self.shipping_method, "selected shipping method no longer offered");
            self.warnings.push(message);
        }
        self.shipping_method = method.id;
        self.quoted_cost = method.cost;
        self.redistribute();
    }

    /// Re-split the current quoted cost over the current lines.
    fn redistribute(&mut self) {
        let weights: Vec<f64> = self.items.iter().map(LineItem::line_weight).collect();
        let shares = distribute_shipping(self.quoted_cost, &weights);
        for (item, share) in self.items.iter_mut().zip(shares) {
            item.shipping_share = share;
        }
    }

    /// Everything the order-entry view displays.
    pub fn totals(&self, config: &PricingConfig, rates: Option<&ExchangeRates>) -> CartTotals {
        let subtotal: f64 = self.items.iter().map(LineItem::line_total).sum();
        let shipping: f64 = self.items.iter().map(|i| i.shipping_share).sum();
        let points: f64 = self.items.iter().map(LineItem::line_points).sum();
        let service_fee = if self.items.is_empty() {
            0.0
        } else {
            config.service_fee
        };
        let grand_total = ceil_to(subtotal + shipping + service_fee, 2);

        let mut by_subcustomer: BTreeMap<String, f64> = BTreeMap::new();
        for item in &self.items {
            let group = item.subcustomer.clone().unwrap_or_default();
            *by_subcustomer.entry(group).or_insert(0.0) += item.line_total();
        }
        for value in by_subcustomer.values_mut() {
            *value = ceil_to(*value, 2);
        }

        let mut warnings = self.warnings.clone();
        let converted = match rates {
            Some(rates) => {
                let (converted, missing) = rates.convert_all(
                    grand_total,
                    &config.base_currency,
                    &config.secondary_currencies,
                );
                if !missing.is_empty() {
                    warnings.push(format!("No exchange rate for {}", missing.join(", ")));
                }
                converted
            }
            None => {
                if !config.secondary_currencies.is_empty() {
                    warnings.push("Exchange rates have not been loaded".to_string());
                }
                BTreeMap::new()
            }
        };

        CartTotals {
            item_count: self.items.len(),
            subtotal: ceil_to(subtotal, 2),
            weight: self.weight(&config.box_weights),
            shipping_method: self.shipping_method.clone(),
            quoted_shipping: self.quoted_cost,
            shipping,
            service_fee,
            grand_total,
            points,
            currency: config.base_currency.clone(),
            converted,
            by_subcustomer,
            unavailable: self
                .items
                .iter()
                .filter(|i| !i.available)
                .map(|i| i.key.clone())
                .collect(),
            warnings,
        }
    }

    /// Check the cart can be turned into an order.
    pub fn ensure_submittable(&self) -> Result<(), CartError> {
        if self.items.is_empty() {
            return Err(CartError::Empty);
        }
        if self.country.is_none() {
            return Err(CartError::MissingCountry);
        }
        let unavailable: Vec<String> = self
            .items
            .iter()
            .filter(|i| !i.available)
            .map(|i| i.product_id.clone())
            .collect();
        if !unavailable.is_empty() {
            return Err(CartError::Unavailable(unavailable));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(product: &str, qty: u32, price: f64, weight: f64) -> LineItemInput {
        LineItemInput {
            product_id: product.into(),
            quantity: qty,
            unit_price: price,
            weight,
            points: 0.0,
            available: true,
            separate_shipping: false,
            subcustomer: None,
        }
    }

    fn method(id: &str, cost: f64) -> ShippingMethod {
        ShippingMethod {
            id: id.into(),
            name: id.into(),
            cost,
        }
    }

    fn table() -> BoxWeightTable {
        BoxWeightTable::new(vec![
            BoxBracket { threshold: 1.0, box_weight: 0.1 },
            BoxBracket { threshold: 5.0, box_weight: 0.3 },
            BoxBracket { threshold: 10.0, box_weight: 0.6 },
        ])
        .expect("valid table")
    }

    /// Cart with a country, one quote applied and `method_id` selected.
    fn quoted_cart(items: Vec<LineItemInput>, cost: f64) -> Cart {
        let mut cart = Cart::new();
        cart.set_country(Some("de"));
        for i in items {
            cart.add_item(i).expect("add");
        }
        let (generation, request) = cart.begin_quote(&table()).expect("needs quote");
        assert!(cart.apply_quote(generation, &request, vec![method("post", cost)]));
        cart.select_shipping("post").expect("select");
        cart
    }

    // ------------------------------------------------------------------
    // Box weights
    // ------------------------------------------------------------------

    #[test]
    fn test_box_weight_picks_smallest_greater_threshold() {
        let t = table();
        assert_eq!(t.box_weight_for(0.0), 0.0);
        assert_eq!(t.box_weight_for(0.5), 0.1);
        // Strictly greater: a weight equal to a threshold moves up a bracket.
        assert_eq!(t.box_weight_for(1.0), 0.3);
        assert_eq!(t.box_weight_for(4.99), 0.3);
        assert_eq!(t.box_weight_for(5.0), 0.6);
        assert_eq!(t.box_weight_for(9.0), 0.6);
        // Beyond every threshold: largest carton.
        assert_eq!(t.box_weight_for(25.0), 0.6);
    }

    #[test]
    fn test_box_weight_is_monotonic() {
        let t = BoxWeightTable::default();
        let mut previous = 0.0;
        for step in 0..=400 {
            let w = step as f64 * 0.1;
            let current = t.box_weight_for(w);
            assert!(
                current >= previous,
                "box weight decreased at {w}: {previous} -> {current}"
            );
            previous = current;
        }
    }

    #[test]
    fn test_box_table_validation() {
        let unsorted = BoxWeightTable::new(vec![
            BoxBracket { threshold: 5.0, box_weight: 0.3 },
            BoxBracket { threshold: 1.0, box_weight: 0.1 },
        ])
        .expect("unsorted input is sorted");
        assert_eq!(unsorted.brackets()[0].threshold, 1.0);

        let decreasing = BoxWeightTable::new(vec![
            BoxBracket { threshold: 1.0, box_weight: 0.5 },
            BoxBracket { threshold: 5.0, box_weight: 0.2 },
        ]);
        assert!(matches!(decreasing, Err(CartError::InvalidBoxTable(_))));

        let duplicate = BoxWeightTable::new(vec![
            BoxBracket { threshold: 1.0, box_weight: 0.1 },
            BoxBracket { threshold: 1.0, box_weight: 0.2 },
        ]);
        assert!(duplicate.is_err());

        let zero = BoxWeightTable::new(vec![BoxBracket { threshold: 0.0, box_weight: 0.1 }]);
        assert!(zero.is_err());

        let empty = BoxWeightTable::new(Vec::new()).expect("empty table allowed");
        assert_eq!(empty.box_weight_for(3.0), 0.0);
    }

    // ------------------------------------------------------------------
    // Weight
    // ------------------------------------------------------------------

    #[test]
    fn test_weight_adds_box_for_combined_items() {
        let mut cart = Cart::new();
        cart.add_item(input("a", 2, 10.0, 0.4)).expect("add");
        cart.add_item(input("b", 1, 5.0, 1.5)).expect("add");
        let w = cart.weight(&table());
        assert!((w.item_weight - 2.3).abs() < 1e-9);
        assert_eq!(w.box_weight, 0.3);
        assert!((w.total_weight - 2.6).abs() < 1e-9);
    }

    #[test]
    fn test_separate_shipping_gets_own_box() {
        let mut cart = Cart::new();
        cart.add_item(input("a", 1, 10.0, 0.5)).expect("add");
        let mut heavy = input("b", 1, 50.0, 6.0);
        heavy.separate_shipping = true;
        cart.add_item(heavy).expect("add");
        let w = cart.weight(&table());
        assert!((w.item_weight - 6.5).abs() < 1e-9);
        // 0.1 for the 0.5 parcel + 0.6 for the separate 6.0 parcel.
        assert!((w.box_weight - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_empty_cart_has_no_weight() {
        let cart = Cart::new();
        let w = cart.weight(&table());
        assert_eq!(w.total_weight, 0.0);
    }

    // ------------------------------------------------------------------
    // Shipping distribution
    // ------------------------------------------------------------------

    #[test]
    fn test_distribution_is_proportional_and_rounds_up() {
        let shares = distribute_shipping(100.0, &[1.0, 2.0, 0.0]);
        // 33.33 -> 34, 66.67 -> 67, 0 -> 0
        assert_eq!(shares, vec![34.0, 67.0, 0.0]);
    }

    #[test]
    fn test_distribution_sum_covers_quote() {
        let cases: Vec<(f64, Vec<f64>)> = vec![
            (100.0, vec![1.0, 1.0, 1.0]),
            (7.0, vec![0.3, 0.3, 0.4]),
            (12.5, vec![0.1, 5.0]),
            (999.0, vec![0.25, 0.25, 0.25, 0.25, 3.0, 1.1]),
            (1.0, vec![10.0]),
        ];
        for (cost, weights) in cases {
            let shares = distribute_shipping(cost, &weights);
            let sum: f64 = shares.iter().sum();
            assert!(sum >= cost, "sum {sum} under quote {cost}");
            assert!(
                sum - cost < weights.len() as f64,
                "sum {sum} exceeds quote {cost} by more than rounding"
            );
            assert!(shares.iter().all(|s| s.fract() == 0.0));
        }
    }

    #[test]
    fn test_zero_weight_splits_evenly() {
        let shares = distribute_shipping(10.0, &[0.0, 0.0, 0.0]);
        assert_eq!(shares, vec![4.0, 4.0, 4.0]);
        let shares = distribute_shipping(9.0, &[0.0, 0.0, 0.0]);
        assert_eq!(shares, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_no_cost_or_no_items() {
        assert!(distribute_shipping(10.0, &[]).is_empty());
        assert_eq!(distribute_shipping(0.0, &[1.0, 2.0]), vec![0.0, 0.0]);
    }

    // ------------------------------------------------------------------
    // Cart lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn test_add_rejects_bad_input() {
        let mut cart = Cart::new();
        assert_eq!(cart.add_item(input(" ", 1, 1.0, 1.0)), Err(CartError::MissingProduct));
        assert_eq!(cart.add_item(input("a", 0, 1.0, 1.0)), Err(CartError::InvalidQuantity));
        assert!(matches!(
            cart.add_item(input("a", 1, -1.0, 1.0)),
            Err(CartError::InvalidNumber { field: "unitPrice", .. })
        ));
        assert!(matches!(
            cart.add_item(input("a", 1, 1.0, f64::NAN)),
            Err(CartError::InvalidNumber { field: "weight", .. })
        ));
        assert!(cart.items().is_empty());
    }

    #[test]
    fn test_keys_are_unique() {
        let mut cart = Cart::new();
        let a = cart.add_item(input("p", 1, 1.0, 1.0)).expect("add");
        let b = cart.add_item(input("p", 1, 1.0, 1.0)).expect("add");
        assert_ne!(a, b);
        assert_eq!(cart.items().len(), 2);
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let mut cart = Cart::new();
        cart.add_item(input("p", 1, 1.0, 1.0)).expect("add");
        assert!(cart.remove_item("missing").is_none());
        assert_eq!(cart.items().len(), 1);
    }

    #[test]
    fn test_update_changes_fields_and_validates_first() {
        let mut cart = Cart::new();
        let key = cart.add_item(input("p", 1, 10.0, 1.0)).expect("add");

        let bad = LineItemPatch {
            quantity: Some(3),
            unit_price: Some(-5.0),
            ..Default::default()
        };
        assert!(cart.update_item(&key, bad).is_err());
        assert_eq!(cart.item(&key).expect("item").quantity, 1);

        let patch = LineItemPatch {
            product_id: Some("q".into()),
            quantity: Some(3),
            subcustomer: Some("  Anna ".into()),
            ..Default::default()
        };
        cart.update_item(&key, patch).expect("update");
        let item = cart.item(&key).expect("item");
        assert_eq!(item.product_id, "q");
        assert_eq!(item.quantity, 3);
        assert_eq!(item.subcustomer.as_deref(), Some("Anna"));

        let clear = LineItemPatch {
            subcustomer: Some(String::new()),
            ..Default::default()
        };
        cart.update_item(&key, clear).expect("update");
        assert!(cart.item(&key).expect("item").subcustomer.is_none());

        assert_eq!(
            cart.update_item("nope", LineItemPatch::default()),
            Err(CartError::UnknownItem("nope".into()))
        );
    }

    #[test]
    fn test_quote_shares_follow_edits() {
        let mut cart = quoted_cart(vec![input("a", 1, 10.0, 1.0), input("b", 1, 10.0, 3.0)], 40.0);
        let shares: Vec<f64> = cart.items().iter().map(|i| i.shipping_share).collect();
        assert_eq!(shares, vec![10.0, 30.0]);

        // Removing a row re-splits the current quote over what is left.
        let first = cart.items()[0].key.clone();
        cart.remove_item(&first);
        assert_eq!(cart.items()[0].shipping_share, 40.0);
    }

    #[test]
    fn test_begin_quote_requires_country_and_items() {
        let mut cart = Cart::new();
        assert!(cart.begin_quote(&table()).is_none());
        cart.add_item(input("a", 1, 1.0, 1.0)).expect("add");
        assert!(cart.begin_quote(&table()).is_none());
        cart.set_country(Some(" fr "));
        let (_, request) = cart.begin_quote(&table()).expect("quote needed");
        assert_eq!(request.country, "FR");
        assert_eq!(request.product_ids, vec!["a"]);
        // 1.0 of items lands in the 5.0 bracket (strictly greater).
        assert!((request.weight - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_stale_quote_is_discarded() {
        let mut cart = Cart::new();
        cart.set_country(Some("DE"));
        cart.add_item(input("a", 1, 10.0, 1.0)).expect("add");
        let (old_gen, old_req) = cart.begin_quote(&table()).expect("quote");
        cart.add_item(input("b", 1, 10.0, 2.0)).expect("add");
        let (new_gen, new_req) = cart.begin_quote(&table()).expect("quote");

        assert!(cart.apply_quote(new_gen, &new_req, vec![method("post", 20.0)]));
        assert!(!cart.apply_quote(old_gen, &old_req, vec![method("post", 5.0)]));
        assert_eq!(cart.methods(), &[method("post", 20.0)]);
    }

    #[test]
    fn test_cached_quote_is_reused() {
        let mut cart = quoted_cart(vec![input("a", 1, 10.0, 1.0)], 12.0);
        let key = cart.items()[0].key.clone();
        cart.update_item(
            &key,
            LineItemPatch {
                quantity: Some(2),
                ..Default::default()
            },
        )
        .expect("update");
        let (generation, request) = cart.begin_quote(&table()).expect("new tuple");
        assert!(cart.apply_quote(generation, &request, vec![method("post", 18.0)]));
        assert_eq!(cart.totals(&PricingConfig::default(), None).shipping, 18.0);

        // Back to the first tuple: served from the memo, no fetch needed.
        cart.update_item(
            &key,
            LineItemPatch {
                quantity: Some(1),
                ..Default::default()
            },
        )
        .expect("update");
        assert!(cart.begin_quote(&table()).is_none());
        assert_eq!(cart.totals(&PricingConfig::default(), None).shipping, 12.0);
    }

    #[test]
    fn test_invalid_method_falls_back_with_warning() {
        let mut cart = quoted_cart(vec![input("a", 1, 10.0, 1.0)], 12.0);
        cart.add_item(input("b", 1, 10.0, 20.0)).expect("add");
        let (generation, request) = cart.begin_quote(&table()).expect("quote");
        cart.apply_quote(generation, &request, vec![method("freight", 90.0)]);

        assert_eq!(cart.shipping_method(), NO_SHIPPING);
        assert_eq!(cart.warnings().len(), 1);
        let totals = cart.totals(&PricingConfig::default(), None);
        assert_eq!(totals.shipping, 0.0);
        assert_eq!(totals.quoted_shipping, 0.0);
        assert!(cart.items().iter().all(|i| i.shipping_share == 0.0));

        assert_eq!(cart.take_warnings().len(), 1);
        assert!(cart.warnings().is_empty());
    }

    #[test]
    fn test_failed_quote_drops_to_sentinel() {
        let mut cart = quoted_cart(vec![input("a", 1, 10.0, 1.0)], 12.0);
        cart.add_item(input("b", 1, 1.0, 1.0)).expect("add");
        let (generation, _) = cart.begin_quote(&table()).expect("quote");
        cart.fail_quote(generation);
        assert_eq!(cart.shipping_method(), NO_SHIPPING);
        assert!(cart.methods().is_empty());
        let totals = cart.totals(&PricingConfig::default(), None);
        assert_eq!(totals.shipping, 0.0);
        assert_eq!(cart.warnings().len(), 1);
        assert!(cart.warnings()[0].contains("\"post\""));
        assert!(totals.warnings.contains(&cart.warnings()[0]));
    }

    #[test]
    fn test_failed_quote_without_selection_is_silent() {
        let mut cart = Cart::new();
        cart.set_country(Some("de"));
        cart.add_item(input("a", 1, 10.0, 1.0)).expect("add");
        let (generation, _) = cart.begin_quote(&table()).expect("quote");
        cart.fail_quote(generation);
        assert_eq!(cart.shipping_method(), NO_SHIPPING);
        assert!(cart.warnings().is_empty());
    }

    #[test]
    fn test_select_unknown_method_errors() {
        let mut cart = quoted_cart(vec![input("a", 1, 10.0, 1.0)], 12.0);
        assert_eq!(
            cart.select_shipping("courier"),
            Err(CartError::UnknownShippingMethod("courier".into()))
        );
        cart.select_shipping(NO_SHIPPING).expect("sentinel always allowed");
        assert_eq!(cart.totals(&PricingConfig::default(), None).shipping, 0.0);
    }

    // ------------------------------------------------------------------
    // Totals
    // ------------------------------------------------------------------

    #[test]
    fn test_totals_with_fee_points_and_currencies() {
        let mut a = input("a", 2, 12.5, 0.5);
        a.points = 10.0;
        a.subcustomer = Some("Anna".into());
        let mut b = input("b", 1, 30.0, 1.0);
        b.points = 25.0;
        let cart = quoted_cart(vec![a, b], 9.0);

        let config = PricingConfig {
            box_weights: table(),
            service_fee: 2.0,
            base_currency: "EUR".into(),
            secondary_currencies: vec!["USD".into(), "RUB".into()],
        };
        let rates = ExchangeRates {
            base: "EUR".into(),
            rates: BTreeMap::from([("USD".to_string(), 1.1), ("RUB".to_string(), 100.0)]),
            fetched_at: Utc::now(),
        };
        let totals = cart.totals(&config, Some(&rates));

        assert_eq!(totals.subtotal, 55.0);
        // Weights 1.0 / 1.0 -> 4.5 each -> 5 + 5.
        assert_eq!(totals.shipping, 10.0);
        assert_eq!(totals.quoted_shipping, 9.0);
        assert_eq!(totals.grand_total, 67.0);
        assert_eq!(totals.points, 45.0);
        assert_eq!(totals.converted.get("USD"), Some(&73.7));
        assert_eq!(totals.converted.get("RUB"), Some(&6700.0));
        assert_eq!(totals.by_subcustomer.get("Anna"), Some(&25.0));
        assert_eq!(totals.by_subcustomer.get(""), Some(&30.0));
        assert!(totals.warnings.is_empty());

        // Recomputing with unchanged rates gives identical conversions.
        let again = cart.totals(&config, Some(&rates));
        assert_eq!(again.converted, totals.converted);
    }

    #[test]
    fn test_empty_cart_has_no_fee() {
        let config = PricingConfig {
            service_fee: 3.0,
            ..Default::default()
        };
        let totals = Cart::new().totals(&config, None);
        assert_eq!(totals.grand_total, 0.0);
        assert_eq!(totals.service_fee, 0.0);
        assert_eq!(totals.warnings, vec!["Exchange rates have not been loaded".to_string()]);
    }

    #[test]
    fn test_missing_rate_is_warned() {
        let cart = quoted_cart(vec![input("a", 1, 10.0, 1.0)], 5.0);
        let rates = ExchangeRates {
            base: "EUR".into(),
            rates: BTreeMap::from([("USD".to_string(), 1.1)]),
            fetched_at: Utc::now(),
        };
        let totals = cart.totals(&PricingConfig::default(), Some(&rates));
        assert!(totals.converted.contains_key("USD"));
        assert!(!totals.converted.contains_key("RUB"));
        assert_eq!(totals.warnings, vec!["No exchange rate for RUB".to_string()]);
    }

    #[test]
    fn test_submittable_checks() {
        let mut cart = Cart::new();
        assert_eq!(cart.ensure_submittable(), Err(CartError::Empty));
        let mut item = input("a", 1, 10.0, 1.0);
        item.available = false;
        cart.add_item(item).expect("add");
        assert_eq!(cart.ensure_submittable(), Err(CartError::MissingCountry));
        cart.set_country(Some("DE"));
        assert_eq!(
            cart.ensure_submittable(),
            Err(CartError::Unavailable(vec!["a".into()]))
        );
        let totals = cart.totals(&PricingConfig::default(), None);
        assert_eq!(totals.unavailable.len(), 1);
    }
}
