use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::entities::order::{self, Entity as OrderEntity, Model as OrderModel};
use crate::entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel};
use crate::errors::ServiceError;
use crate::services::order_status::OrderStatus;

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

/// Who is asking. Operators see every order; users see their own.
#[derive(Debug, Clone, Copy)]
pub struct OrderViewer {
    pub user_id: Uuid,
    pub operator: bool,
}

impl From<&CurrentUser> for OrderViewer {
    fn from(user: &CurrentUser) -> Self {
        Self {
            user_id: user.user_id,
            operator: user.is_operator(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub store_id: Uuid,
    pub status: String,
    pub order_date: DateTime<Utc>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub tax_rate: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipped_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl From<OrderModel> for OrderResponse {
    fn from(order: OrderModel) -> Self {
        let shipping_address = order
            .shipping_address
            .map(|raw| serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)));
        Self {
            id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            store_id: order.store_id,
            status: order.status,
            order_date: order.order_date,
            subtotal: order.subtotal,
            tax_amount: order.tax_amount,
            tax_rate: order.tax_rate,
            shipping_amount: order.shipping_amount,
            total_amount: order.total_amount,
            currency: order.currency,
            payment_method: order.payment_method,
            payment_intent_id: order.payment_intent_id,
            shipping_address,
            tracking_number: order.tracking_number,
            shipped_date: order.shipped_date,
            delivered_date: order.delivered_date,
            created_at: order.created_at,
            updated_at: order.updated_at,
            version: order.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_image: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub is_reservation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_notes: Option<String>,
}

impl From<OrderItemModel> for OrderItemResponse {
    fn from(item: OrderItemModel) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            product_name: item.product_name,
            product_image: item.product_image,
            quantity: item.quantity,
            unit_price: item.unit_price,
            subtotal: item.subtotal,
            is_reservation: item.is_reservation,
            reservation_date: item.reservation_date,
            reservation_time: item.reservation_time,
            reservation_notes: item.reservation_notes,
        }
    }
}

/// An order with its line items.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderListFilter {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Read side of the order store.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn visible_to(&self, order: &OrderModel, viewer: &OrderViewer) -> bool {
        viewer.operator || order.user_id == Some(viewer.user_id)
    }

    /// Fetch one order with items. Orders outside the viewer's scope read as
    /// not found, so ids cannot be probed.
    #[instrument(skip(self, viewer), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        viewer: &OrderViewer,
        order_id: Uuid,
    ) -> Result<OrderDetailResponse, ServiceError> {
        let db = &*self.db;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if !self.visible_to(&order, viewer) {
            return Err(ServiceError::OrderNotFound(order_id));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(OrderDetailResponse {
            order: order.into(),
            items: items.into_iter().map(OrderItemResponse::from).collect(),
        })
    }

    /// List the viewer's orders, newest first, with an optional status filter.
    #[instrument(skip(self, viewer))]
    pub async fn list_orders(
        &self,
        viewer: &OrderViewer,
        filter: OrderListFilter,
    ) -> Result<OrderListResponse, ServiceError> {
        let status = match &filter.status {
            Some(raw) if !raw.is_empty() => Some(OrderStatus::parse(raw)?),
            _ => None,
        };
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0);

        let db = &*self.db;
        let mut query = OrderEntity::find();
        if !viewer.operator {
            query = query.filter(order::Column::UserId.eq(viewer.user_id));
        }
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status.to_string()));
        }

        let total = query.clone().count(db).await?;
        let orders = query
            .order_by_desc(order::Column::CreatedAt)
            .limit(limit)
            .offset(offset)
            .all(db)
            .await?;

        info!(total, returned = orders.len(), "Orders listed");
        Ok(OrderListResponse {
            orders: orders.into_iter().map(OrderResponse::from).collect(),
            total,
        })
    }

    /// All orders carrying a payment intent id, sorted by creation. When a
    /// user scope is given, other users' orders stay invisible.
    #[instrument(skip(self))]
    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
        user_scope: Option<Uuid>,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        let db = &*self.db;
        let mut query = OrderEntity::find()
            .filter(order::Column::PaymentIntentId.eq(payment_intent_id));
        if let Some(user_id) = user_scope {
            query = query.filter(order::Column::UserId.eq(user_id));
        }
        let orders = query.order_by_asc(order::Column::CreatedAt).all(db).await?;
        Ok(orders)
    }
}
