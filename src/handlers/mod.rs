//! HTTP surface of the checkout-and-order core.
//!
//! Handlers stay thin: extract identity, validate, call one service, wrap
//! the result. All business rules live in `services`.

pub mod addresses;
pub mod carts;
pub mod orders;
pub mod payments;
pub mod pricing;

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::auth::{MaybeUser, SessionService};
use crate::errors::ServiceError;
use crate::services::addresses::AddressService;
use crate::services::carts::{CartOwner, CartService};
use crate::services::checkout::CheckoutService;
use crate::services::order_status::OrderStatusService;
use crate::services::orders::OrderService;
use crate::services::pricing::PricingService;
use crate::services::reservations::ReservationChecker;

/// Header carrying the opaque cart token for guest visitors.
pub const CART_TOKEN_HEADER: &str = "x-cart-token";

/// Service registry handed to every handler through `AppState`.
#[derive(Clone)]
pub struct AppServices {
    pub sessions: Arc<SessionService>,
    pub checkout: Arc<CheckoutService>,
    pub order_status: Arc<OrderStatusService>,
    pub orders: Arc<OrderService>,
    pub carts: Arc<CartService>,
    pub addresses: Arc<AddressService>,
    pub pricing: Arc<PricingService>,
    pub reservations: Arc<ReservationChecker>,
}

fn cart_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CART_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The cart a request operates on: the session user's when signed in,
/// otherwise the guest cart named by the cart-token header.
pub(crate) fn resolve_cart_owner(
    user: &MaybeUser,
    headers: &HeaderMap,
) -> Result<CartOwner, ServiceError> {
    if let Some(user) = &user.0 {
        return Ok(CartOwner::User(user.user_id));
    }
    cart_token(headers)
        .map(CartOwner::Guest)
        .ok_or(ServiceError::AuthenticationRequired)
}
