use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::entities::order_activity::Model as ActivityModel;
use crate::errors::ServiceError;
use crate::services::order_status::OrderStatus;
use crate::services::orders::{
    OrderDetailResponse, OrderListFilter, OrderListResponse, OrderResponse, OrderViewer,
};
use crate::{ApiResponse, AppState};

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/activity", get(get_order_activity))
        .route(
            "/:id/status",
            put(update_order_status).patch(update_order_status),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListQuery {
    pub payment_intent_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Either a paged listing or a payment-intent resolution, depending on the
/// query. The two shapes match what the storefront consumes.
#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum OrderListReply {
    ByIntent(ApiResponse<Vec<OrderResponse>>),
    Page(OrderListResponse),
}

/// List orders, or resolve them by payment intent.
///
/// `?paymentIntentId=` answers with the `{success, data}` envelope the
/// checkout return page reads; otherwise this is a plain paged listing.
#[utoipa::path(
    get,
    path = "/api/orders",
    summary = "List orders",
    params(
        ("paymentIntentId" = Option<String>, Query, description = "Resolve orders created by this payment intent"),
        ("status" = Option<String>, Query, description = "Filter by order status"),
        ("limit" = Option<u64>, Query, description = "Page size (default 20, max 100)"),
        ("offset" = Option<u64>, Query, description = "Page offset"),
    ),
    responses(
        (status = 200, description = "Orders retrieved", body = OrderListResponse),
        (status = 401, description = "Authentication required", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<OrderListReply>, ServiceError> {
    let viewer = OrderViewer::from(&user);

    if let Some(intent) = query
        .payment_intent_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        let scope = if viewer.operator {
            None
        } else {
            Some(viewer.user_id)
        };
        let orders = state
            .services
            .orders
            .find_by_payment_intent(intent, scope)
            .await?;
        let data: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
        return Ok(Json(OrderListReply::ByIntent(ApiResponse::success(data))));
    }

    let page = state
        .services
        .orders
        .list_orders(
            &viewer,
            OrderListFilter {
                status: query.status,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;
    Ok(Json(OrderListReply::Page(page)))
}

#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order retrieved", body = OrderDetailResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetailResponse>, ServiceError> {
    let detail = state
        .services
        .orders
        .get_order(&OrderViewer::from(&user), id)
        .await?;
    Ok(Json(detail))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderActivityResponse {
    pub id: Uuid,
    pub actor: String,
    pub from_status: String,
    pub to_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ActivityModel> for OrderActivityResponse {
    fn from(entry: ActivityModel) -> Self {
        Self {
            id: entry.id,
            actor: entry.actor,
            from_status: entry.from_status,
            to_status: entry.to_status,
            tracking_number: entry.tracking_number,
            created_at: entry.created_at,
        }
    }
}

/// Audit trail for one order, oldest entry first. Operators only.
#[utoipa::path(
    get,
    path = "/api/orders/{id}/activity",
    summary = "Order activity log",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Activity entries", body = [OrderActivityResponse]),
        (status = 403, description = "Operator role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order_activity(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<OrderActivityResponse>>, ServiceError> {
    user.require_operator()?;
    let entries = state.services.order_status.activity_for_order(id).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(OrderActivityResponse::from)
            .collect(),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: String,
    pub tracking_number: Option<String>,
}

/// Apply a status transition to an order.
#[utoipa::path(
    put,
    path = "/api/orders/{id}/status",
    summary = "Update order status",
    request_body = UpdateStatusRequest,
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Status applied", body = OrderResponse),
        (status = 403, description = "Operator role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Illegal transition or no changes", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<OrderResponse>, ServiceError> {
    user.require_operator()?;

    let new_status = OrderStatus::parse(&request.status)?;
    let tracking = request
        .tracking_number
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let actor = format!("operator:{}", user.user_id);
    let updated = state
        .services
        .order_status
        .apply_status(id, &actor, new_status, tracking)
        .await?;
    Ok(Json(updated.into()))
}
