use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;

use crate::clients::TaxJurisdiction;
use crate::errors::ServiceError;

/// One line of a pricing request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PricingItem {
    pub price: Decimal,
    pub quantity: u32,
}

/// Destination used for the jurisdiction lookup. Only the postal code is
/// required; state and country refine the fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AddressInput {
    pub zip: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
}

/// The reproducible decomposition of a cart's cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "subtotal": "42.00",
    "taxAmount": "3.73",
    "taxRate": "0.08875",
    "shippingAmount": "5.99",
    "total": "51.72"
}))]
pub struct PricingBreakdown {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub tax_rate: Decimal,
    pub shipping_amount: Decimal,
    pub total: Decimal,
}

/// Per-owner generation counter implementing last-request-wins for quotes.
///
/// `begin` stamps a computation with the current generation; `commit` stores
/// its result only while that generation is still the newest. Cart mutations
/// call `invalidate`, which bumps the generation and drops the stored quote,
/// so an in-flight computation started before the mutation can never land.
#[derive(Default)]
pub struct QuoteCoalescer {
    cells: DashMap<String, Arc<QuoteCell>>,
}

#[derive(Default)]
struct QuoteCell {
    generation: AtomicU64,
    displayed: Mutex<Option<(u64, PricingBreakdown)>>,
}

impl QuoteCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, owner_key: &str) -> Arc<QuoteCell> {
        self.cells
            .entry(owner_key.to_string())
            .or_default()
            .clone()
    }

    /// Start a new computation for this owner, superseding any in flight.
    pub fn begin(&self, owner_key: &str) -> u64 {
        self.cell(owner_key).generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Supersede any in-flight computation and drop the stored quote.
    pub fn invalidate(&self, owner_key: &str) {
        let cell = self.cell(owner_key);
        cell.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut displayed) = cell.displayed.lock() {
            *displayed = None;
        };
    }

    /// Store a computed quote; returns false when a newer generation superseded it.
    pub fn commit(&self, owner_key: &str, generation: u64, breakdown: PricingBreakdown) -> bool {
        let cell = self.cell(owner_key);
        let Ok(mut displayed) = cell.displayed.lock() else {
            return false;
        };
        if cell.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *displayed = Some((generation, breakdown));
        true
    }

    /// The quote cart views display, if a current one exists.
    pub fn latest(&self, owner_key: &str) -> Option<PricingBreakdown> {
        let cell = self.cells.get(owner_key)?.clone();
        let displayed = cell.displayed.lock().ok()?;
        displayed.as_ref().map(|(_, breakdown)| breakdown.clone())
    }
}

/// Jurisdiction rates for common US postal-code prefixes. Longest matching
/// prefix wins; falls through to the state table, then the configured default.
const ZIP_RATES: &[(&str, Decimal)] = &[
    ("100", dec!(0.08875)),
    ("101", dec!(0.08875)),
    ("102", dec!(0.08875)),
    ("103", dec!(0.08875)),
    ("104", dec!(0.08875)),
    ("606", dec!(0.1025)),
    ("787", dec!(0.0825)),
    ("900", dec!(0.095)),
    ("941", dec!(0.08625)),
    ("981", dec!(0.1035)),
];

const STATE_RATES: &[(&str, Decimal)] = &[
    ("AZ", dec!(0.056)),
    ("CA", dec!(0.0725)),
    ("CO", dec!(0.029)),
    ("DE", dec!(0.0)),
    ("FL", dec!(0.06)),
    ("IL", dec!(0.0625)),
    ("MA", dec!(0.0625)),
    ("MT", dec!(0.0)),
    ("NH", dec!(0.0)),
    ("NJ", dec!(0.06625)),
    ("NY", dec!(0.08)),
    ("OR", dec!(0.0)),
    ("PA", dec!(0.06)),
    ("TX", dec!(0.0625)),
    ("WA", dec!(0.065)),
];

/// Embedded tax table used when no jurisdiction service is configured.
#[derive(Debug, Clone)]
pub struct StaticTaxTable {
    default_rate: Decimal,
}

impl StaticTaxTable {
    pub fn new(default_rate: Decimal) -> Self {
        Self { default_rate }
    }

    fn rate_for(&self, zip: &str, state: &str) -> Decimal {
        let zip = zip.trim();
        let mut best: Option<(usize, Decimal)> = None;
        for (prefix, rate) in ZIP_RATES {
            if zip.starts_with(prefix) && best.map_or(true, |(len, _)| prefix.len() > len) {
                best = Some((prefix.len(), *rate));
            }
        }
        if let Some((_, rate)) = best {
            return rate;
        }
        let state = state.trim();
        for (code, rate) in STATE_RATES {
            if state.eq_ignore_ascii_case(code) {
                return *rate;
            }
        }
        self.default_rate
    }
}

#[async_trait::async_trait]
impl TaxJurisdiction for StaticTaxTable {
    async fn lookup(
        &self,
        zip: &str,
        state: &str,
        _country: &str,
    ) -> Result<Decimal, ServiceError> {
        Ok(self.rate_for(zip, state))
    }
}

/// Computes authoritative pricing breakdowns.
#[derive(Clone)]
pub struct PricingService {
    tax: Arc<dyn TaxJurisdiction>,
    coalescer: Arc<QuoteCoalescer>,
    shipping_flat_fee: Decimal,
    free_shipping_threshold: Decimal,
    upstream_timeout: Duration,
}

impl PricingService {
    pub fn new(
        tax: Arc<dyn TaxJurisdiction>,
        coalescer: Arc<QuoteCoalescer>,
        shipping_flat_fee: Decimal,
        free_shipping_threshold: Decimal,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            tax,
            coalescer,
            shipping_flat_fee,
            free_shipping_threshold,
            upstream_timeout,
        }
    }

    fn subtotal(items: &[PricingItem]) -> Decimal {
        items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum()
    }

    /// Flat fee below the threshold, waived at and above it.
    pub fn shipping_fee(&self, subtotal: Decimal) -> Decimal {
        if subtotal >= self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.shipping_flat_fee
        }
    }

    fn validate_inputs(items: &[PricingItem], address: &AddressInput) -> Result<(), ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one item is required".to_string(),
            ));
        }
        for item in items {
            if item.quantity < 1 {
                return Err(ServiceError::ValidationError(
                    "item quantity must be at least 1".to_string(),
                ));
            }
            if item.price.is_sign_negative() {
                return Err(ServiceError::ValidationError(
                    "item price must not be negative".to_string(),
                ));
            }
        }
        if Self::subtotal(items) <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "subtotal must be greater than zero".to_string(),
            ));
        }
        if address.zip.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "shipping address postal code is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Compute a breakdown for the given items and destination.
    #[instrument(skip(self, items), fields(item_count = items.len(), zip = %address.zip))]
    pub async fn compute(
        &self,
        items: &[PricingItem],
        address: &AddressInput,
    ) -> Result<PricingBreakdown, ServiceError> {
        Self::validate_inputs(items, address)?;

        let subtotal = Self::subtotal(items);
        let lookup = self
            .tax
            .lookup(&address.zip, &address.state, &address.country);
        let tax_rate = match tokio::time::timeout(self.upstream_timeout, lookup).await {
            Ok(Ok(rate)) => rate,
            Ok(Err(ServiceError::UpstreamUnavailable(msg))) => {
                return Err(ServiceError::PricingUnavailable(msg))
            }
            Ok(Err(other)) => return Err(other),
            Err(_) => {
                return Err(ServiceError::PricingUnavailable(
                    "tax rate lookup timed out".to_string(),
                ))
            }
        };

        let tax_amount =
            (subtotal * tax_rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let shipping_amount = self.shipping_fee(subtotal);
        let total = subtotal + tax_amount + shipping_amount;

        info!(
            %subtotal,
            %tax_rate,
            %tax_amount,
            %shipping_amount,
            %total,
            "Pricing computed"
        );

        Ok(PricingBreakdown {
            subtotal,
            tax_amount,
            tax_rate,
            shipping_amount,
            total,
        })
    }

    /// Compute for a known cart owner, entering the result into the
    /// last-request-wins cell that cart views read.
    pub async fn compute_for_owner(
        &self,
        owner_key: &str,
        items: &[PricingItem],
        address: &AddressInput,
    ) -> Result<PricingBreakdown, ServiceError> {
        let generation = self.coalescer.begin(owner_key);
        let breakdown = self.compute(items, address).await?;
        if !self.coalescer.commit(owner_key, generation, breakdown.clone()) {
            debug!(owner_key, generation, "Pricing result superseded, not applied");
        }
        Ok(breakdown)
    }

    /// The current displayed quote for an owner, if any.
    pub fn displayed_quote(&self, owner_key: &str) -> Option<PricingBreakdown> {
        self.coalescer.latest(owner_key)
    }

    /// Supersede any in-flight computation for this owner. Used when a
    /// pricing input changes outside the cart, such as address selection.
    pub fn invalidate_quote(&self, owner_key: &str) {
        self.coalescer.invalidate(owner_key);
    }
}
