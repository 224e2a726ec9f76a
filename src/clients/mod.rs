//! External collaborators, consumed through traits.
//!
//! The payment provider, the catalog's slot-availability check and the tax
//! jurisdiction lookup all live outside this service. Each is modeled as a
//! trait so tests can substitute deterministic fakes and the HTTP wiring
//! stays in one place (`http`).

pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Whether the provider considers the session paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Paid,
    Unpaid,
}

/// Address fields the gateway collected during checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSnapshot {
    pub street: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

/// A checkout session as retrieved from the payment provider.
///
/// Resolved into a typed value once, at this boundary; nothing downstream
/// re-inspects raw gateway payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySession {
    pub id: String,
    pub payment_state: PaymentState,
    pub payment_intent_id: String,
    /// The cart owner key attached as the client reference when the session was created
    pub cart_owner_key: String,
    pub payment_method: Option<String>,
    pub shipping_address: Option<AddressSnapshot>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Retrieve the state of a checkout session by provider session id.
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlotAvailability: Send + Sync {
    /// Whether the given product's slot at (date, time) is still free.
    async fn check(&self, product_id: Uuid, date: &str, time: &str)
        -> Result<bool, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaxJurisdiction: Send + Sync {
    /// Tax rate for a destination, keyed on postal code with
    /// state/country fallback. Returned as a decimal fraction (0.08875 = 8.875%).
    async fn lookup(&self, zip: &str, state: &str, country: &str)
        -> Result<Decimal, ServiceError>;
}
