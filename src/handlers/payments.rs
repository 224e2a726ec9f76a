use axum::{
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};

use crate::auth::{CurrentUser, MaybeUser};
use crate::services::checkout::{CompletionOutcome, CompletionRequest, Identity};
use crate::AppState;

use super::CART_TOKEN_HEADER;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout-complete", post(checkout_complete))
        .route("/guest-checkout-complete", post(guest_checkout_complete))
}

/// Resolve a completed payment into its orders for a signed-in user.
///
/// Always answers 200: `success: false` in the body is the failure signal,
/// since the payment may have succeeded even when resolution did not and the
/// caller recovers by calling again.
#[utoipa::path(
    post,
    path = "/api/payments/checkout-complete",
    summary = "Resolve checkout completion",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Resolution outcome", body = CompletionOutcome),
    ),
    tag = "payments"
)]
pub async fn checkout_complete(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(request): Json<CompletionRequest>,
) -> Json<CompletionOutcome> {
    let identity = match user.0 {
        Some(CurrentUser { user_id, .. }) => Identity::User(user_id),
        None => Identity::Anonymous,
    };
    Json(state.services.checkout.resolve(&identity, &request).await)
}

/// Guest variant: the cart-token header stands in for a session.
#[utoipa::path(
    post,
    path = "/api/payments/guest-checkout-complete",
    summary = "Resolve checkout completion (guest)",
    request_body = CompletionRequest,
    params(
        ("x-cart-token" = String, Header, description = "Guest cart token"),
    ),
    responses(
        (status = 200, description = "Resolution outcome", body = CompletionOutcome),
    ),
    tag = "payments"
)]
pub async fn guest_checkout_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Json<CompletionOutcome> {
    let identity = headers
        .get(CART_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|token| Identity::Guest(token.to_string()))
        .unwrap_or(Identity::Anonymous);
    Json(state.services.checkout.resolve(&identity, &request).await)
}
