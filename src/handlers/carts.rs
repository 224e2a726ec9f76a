use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post, put},
    Json, Router,
};
use uuid::Uuid;

use crate::auth::MaybeUser;
use crate::errors::ServiceError;
use crate::services::carts::{AddItemRequest, CartView};
use crate::AppState;

use super::resolve_cart_owner;

pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).delete(clear_cart))
        .route("/items", post(add_item))
        .route("/items/:id", put(update_item))
        .route("/items/:id", delete(remove_item))
        .route("/reservation-check", post(reservation_check))
}

/// Current cart with the local subtotal and, when one survived the pricing
/// generation check, the authoritative quote.
pub async fn get_cart(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(state.services.carts.get_cart(&owner).await?))
}

pub async fn add_item(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
    Json(request): Json<AddItemRequest>,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(state.services.carts.add_item(&owner, request).await?))
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

pub async fn update_item(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateQuantityRequest>,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(
        state
            .services
            .carts
            .update_quantity(&owner, id, request.quantity)
            .await?,
    ))
}

pub async fn remove_item(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(state.services.carts.remove_item(&owner, id).await?))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(state.services.carts.clear(&owner).await?))
}

/// Run the reservation conflict check on demand. Evicted items come back in
/// the view's `evictions` list, exactly once.
pub async fn reservation_check(
    State(state): State<AppState>,
    user: MaybeUser,
    headers: HeaderMap,
) -> Result<Json<CartView>, ServiceError> {
    let owner = resolve_cart_owner(&user, &headers)?;
    Ok(Json(state.services.carts.reservation_check(&owner).await?))
}
