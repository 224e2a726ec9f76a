use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::errors::ServiceError;
use crate::services::addresses::{AddressRequest, AddressResponse};
use crate::AppState;

pub fn address_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_addresses).post(create_address))
        .route("/:id", put(update_address).delete(delete_address))
        .route("/:id/default", post(set_default_address))
}

pub async fn list_addresses(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<AddressResponse>>, ServiceError> {
    Ok(Json(state.services.addresses.list(user.user_id).await?))
}

pub async fn create_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<AddressRequest>,
) -> Result<(StatusCode, Json<AddressResponse>), ServiceError> {
    let created = state
        .services
        .addresses
        .create(user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<AddressResponse>, ServiceError> {
    Ok(Json(
        state
            .services
            .addresses
            .update(user.user_id, id, request)
            .await?,
    ))
}

pub async fn delete_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.services.addresses.delete(user.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Selecting an address is a pricing signal even when its fields are
/// unchanged, so promotion also bumps the user's quote generation.
pub async fn set_default_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<AddressResponse>, ServiceError> {
    let promoted = state
        .services
        .addresses
        .set_default(user.user_id, id)
        .await?;
    state
        .services
        .pricing
        .invalidate_quote(&crate::services::carts::CartOwner::User(user.user_id).key());
    Ok(Json(promoted))
}
