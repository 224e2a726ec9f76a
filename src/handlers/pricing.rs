use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::MaybeUser;
use crate::errors::ServiceError;
use crate::services::pricing::{AddressInput, PricingBreakdown, PricingItem};
use crate::AppState;

use super::resolve_cart_owner;

pub fn pricing_routes() -> Router<AppState> {
    Router::new().route("/compute", post(compute_pricing))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PricingRequest {
    pub items: Vec<PricingItem>,
    pub shipping_address: AddressInput,
}

/// Compute an authoritative price breakdown for a candidate cart and
/// destination.
///
/// When the caller has a cart (session or guest token), the result also
/// enters that cart's last-request-wins quote cell; anonymous callers just
/// get the computation.
#[utoipa::path(
    post,
    path = "/api/pricing/compute",
    summary = "Compute pricing breakdown",
    request_body = PricingRequest,
    responses(
        (status = 200, description = "Breakdown computed", body = PricingBreakdown),
        (status = 400, description = "Preconditions not met", body = crate::errors::ErrorResponse),
        (status = 503, description = "Jurisdiction lookup unavailable", body = crate::errors::ErrorResponse),
    ),
    tag = "pricing"
)]
pub async fn compute_pricing(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
    Json(request): Json<PricingRequest>,
) -> Result<Json<PricingBreakdown>, ServiceError> {
    let breakdown = match resolve_cart_owner(&user, &headers) {
        Ok(owner) => {
            state
                .services
                .pricing
                .compute_for_owner(&owner.key(), &request.items, &request.shipping_address)
                .await?
        }
        Err(_) => {
            state
                .services
                .pricing
                .compute(&request.items, &request.shipping_address)
                .await?
        }
    };
    Ok(Json(breakdown))
}
