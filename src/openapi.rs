//! OpenAPI documentation, served through Swagger UI at `/docs`.

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "marketplace-api",
        description = "Checkout-and-order lifecycle core: completion resolution, order status machine, reservation conflict eviction and pricing.",
    ),
    paths(
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_activity,
        crate::handlers::orders::update_order_status,
        crate::handlers::payments::checkout_complete,
        crate::handlers::payments::guest_checkout_complete,
        crate::handlers::pricing::compute_pricing,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::handlers::orders::OrderActivityResponse,
        crate::handlers::orders::UpdateStatusRequest,
        crate::handlers::carts::UpdateQuantityRequest,
        crate::handlers::pricing::PricingRequest,
        crate::services::orders::OrderResponse,
        crate::services::orders::OrderItemResponse,
        crate::services::orders::OrderDetailResponse,
        crate::services::orders::OrderListResponse,
        crate::services::checkout::CompletionRequest,
        crate::services::checkout::CompletionOutcome,
        crate::services::carts::AddItemRequest,
        crate::services::carts::CartItemView,
        crate::services::carts::CartView,
        crate::services::reservations::EvictedItem,
        crate::services::pricing::PricingItem,
        crate::services::pricing::AddressInput,
        crate::services::pricing::PricingBreakdown,
        crate::services::addresses::AddressRequest,
        crate::services::addresses::AddressResponse,
    )),
    tags(
        (name = "orders", description = "Order queries and status transitions"),
        (name = "payments", description = "Checkout completion resolution"),
        (name = "pricing", description = "Price breakdown computation"),
    )
)]
pub struct ApiDoc;

pub fn swagger_router() -> Router<AppState> {
    Router::new().merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_builds_and_lists_core_paths() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).unwrap();
        let paths = json["paths"].as_object().unwrap();

        assert!(paths.contains_key("/api/orders"));
        assert!(paths.contains_key("/api/orders/{id}/status"));
        assert!(paths.contains_key("/api/payments/checkout-complete"));
        assert!(paths.contains_key("/api/pricing/compute"));
    }
}
