//! reqwest-backed implementations of the collaborator traits.
//!
//! Every client is built with a request timeout taken from configuration, so
//! a stalled upstream surfaces as `UpstreamUnavailable` instead of hanging a
//! checkout or pricing call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::errors::ServiceError;

use super::{
    AddressSnapshot, GatewaySession, PaymentGateway, PaymentState, SlotAvailability,
    TaxJurisdiction,
};

fn build_client(timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to construct HTTP client: {}", e)))
}

fn upstream_error(what: &str, err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::UpstreamUnavailable(format!("{} timed out", what))
    } else {
        ServiceError::UpstreamUnavailable(format!("{} request failed: {}", what, err))
    }
}

/// Payment provider client.
///
/// Talks to the provider's checkout-session endpoint; the session id handed
/// to us by the storefront is resolved into a [`GatewaySession`] here and
/// nothing downstream touches raw provider payloads.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    id: String,
    payment_status: String,
    payment_intent_id: String,
    client_reference_id: String,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    shipping_address: Option<AddressSnapshot>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = build_client(timeout)?;
        Ok(Self::with_client(base_url, secret, client))
    }

    /// Build from an existing client (useful for testing).
    pub fn with_client(base_url: impl Into<String>, secret: Option<String>, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
        let url = format!("{}/v1/checkout/sessions/{}", self.base_url, session_id);
        let mut request = self.client.get(&url);
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| upstream_error("payment gateway", &e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(ServiceError::NotFound(format!(
                    "Checkout session {} not found",
                    session_id
                )))
            }
            status if !status.is_success() => {
                return Err(ServiceError::UpstreamUnavailable(format!(
                    "payment gateway returned {}",
                    status
                )))
            }
            _ => {}
        }

        let payload: SessionPayload = response
            .json()
            .await
            .map_err(|e| upstream_error("payment gateway", &e))?;

        let payment_state = if payload.payment_status.eq_ignore_ascii_case("paid") {
            PaymentState::Paid
        } else {
            PaymentState::Unpaid
        };

        Ok(GatewaySession {
            id: payload.id,
            payment_state,
            payment_intent_id: payload.payment_intent_id,
            cart_owner_key: payload.client_reference_id,
            payment_method: payload.payment_method,
            shipping_address: payload.shipping_address,
        })
    }
}

/// Catalog slot-availability client.
#[derive(Clone)]
pub struct HttpSlotAvailability {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityRequest<'a> {
    product_id: Uuid,
    date: &'a str,
    time: &'a str,
}

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    available: bool,
}

impl HttpSlotAvailability {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = build_client(timeout)?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SlotAvailability for HttpSlotAvailability {
    #[instrument(skip(self))]
    async fn check(
        &self,
        product_id: Uuid,
        date: &str,
        time: &str,
    ) -> Result<bool, ServiceError> {
        let url = format!("{}/availability/check", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AvailabilityRequest {
                product_id,
                date,
                time,
            })
            .send()
            .await
            .map_err(|e| upstream_error("availability service", &e))?;

        if !response.status().is_success() {
            return Err(ServiceError::UpstreamUnavailable(format!(
                "availability service returned {}",
                response.status()
            )));
        }

        let payload: AvailabilityResponse = response
            .json()
            .await
            .map_err(|e| upstream_error("availability service", &e))?;
        Ok(payload.available)
    }
}

/// Tax jurisdiction lookup client.
///
/// The rate travels on the wire as a decimal string so no precision is lost
/// between the tax service and our pricing math.
#[derive(Clone)]
pub struct HttpTaxService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TaxRateResponse {
    rate: Decimal,
}

impl HttpTaxService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = build_client(timeout)?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TaxJurisdiction for HttpTaxService {
    #[instrument(skip(self))]
    async fn lookup(
        &self,
        zip: &str,
        state: &str,
        country: &str,
    ) -> Result<Decimal, ServiceError> {
        let url = format!("{}/rates", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("zip", zip), ("state", state), ("country", country)])
            .send()
            .await
            .map_err(|e| upstream_error("tax service", &e))?;

        if !response.status().is_success() {
            return Err(ServiceError::UpstreamUnavailable(format!(
                "tax service returned {}",
                response.status()
            )));
        }

        let payload: TaxRateResponse = response
            .json()
            .await
            .map_err(|e| upstream_error("tax service", &e))?;
        Ok(payload.rate)
    }
}
