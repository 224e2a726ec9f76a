use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
};
use crate::entities::order_activity::{
    self, ActiveModel as ActivityActiveModel, Entity as ActivityEntity,
    Model as ActivityModel,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Lifecycle states of an order.
///
/// The main line runs `pending_payment → pending → processing → shipped →
/// delivered`; `cancelled` and `return_processing → returned` branch off from
/// any non-terminal state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    ReturnProcessing,
    Returned,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Returned
        )
    }

    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        value
            .parse()
            .map_err(|_| ServiceError::ValidationError(format!("Unknown order status: {}", value)))
    }
}

/// Whether the lifecycle graph permits moving from one status to another.
pub fn transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match (from, to) {
        (PendingPayment, Pending) => true,
        (Pending, Processing) => true,
        (Processing, Shipped) => true,
        (Shipped, Delivered) => true,
        (ReturnProcessing, Returned) => true,
        (from, Cancelled) if !from.is_terminal() => true,
        (from, ReturnProcessing) if !from.is_terminal() && from != ReturnProcessing => true,
        _ => false,
    }
}

/// Applies status transitions to orders, one writer per order at a time.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db,
            event_sender,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply `new_status` to an order.
    ///
    /// Rejects repeats of the current status with `NoChanges`, illegal jumps
    /// with `InvalidTransition`, and records an activity entry in the same
    /// transaction as the order row so the audit trail is durable before the
    /// transition is reported back.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn apply_status(
        &self,
        order_id: Uuid,
        actor: &str,
        new_status: OrderStatus,
        tracking_number: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let lock = self.lock_for(order_id);
        let _serialized = lock.lock().await;

        let db = &*self.db;
        let txn = db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        let current = OrderStatus::parse(&order.status).map_err(|_| {
            error!(order_id = %order_id, status = %order.status, "Order carries unrecognized status");
            ServiceError::InternalError(format!(
                "order {} carries unrecognized status {}",
                order_id, order.status
            ))
        })?;

        let tracking_changed = tracking_number.is_some()
            && tracking_number.as_deref() != order.tracking_number.as_deref();

        if new_status == current {
            if !tracking_changed {
                return Err(ServiceError::NoChanges);
            }
            if current != OrderStatus::Shipped {
                return Err(ServiceError::ValidationError(
                    "tracking number can only be updated on shipped orders".to_string(),
                ));
            }
        } else if !transition_allowed(current, new_status) {
            warn!(from = %current, to = %new_status, "Rejected status transition");
            return Err(ServiceError::InvalidTransition {
                from: current.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        let version = order.version;
        let shipped_date = order.shipped_date;
        let delivered_date = order.delivered_date;

        let mut active: OrderActiveModel = order.into();
        active.status = Set(new_status.to_string());
        if tracking_changed {
            active.tracking_number = Set(tracking_number.clone());
        }
        // Lifecycle timestamps are set the first time the status is reached
        // and never touched again.
        if new_status == OrderStatus::Shipped && shipped_date.is_none() {
            active.shipped_date = Set(Some(now));
        }
        if new_status == OrderStatus::Delivered && delivered_date.is_none() {
            active.delivered_date = Set(Some(now));
        }
        active.updated_at = Set(Some(now));
        active.version = Set(version + 1);

        let updated = active.update(&txn).await.map_err(|e| {
            error!("Failed to update order {} status: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        let activity = ActivityActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            actor: Set(actor.to_string()),
            from_status: Set(current.to_string()),
            to_status: Set(new_status.to_string()),
            tracking_number: Set(tracking_number),
            created_at: Set(now),
        };
        activity.insert(&txn).await.map_err(|e| {
            error!("Failed to record order {} activity: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction for order {}: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        info!(
            "Order {} status updated from '{}' to '{}'",
            order_id, current, new_status
        );

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: current.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(updated)
    }

    /// Activity log for an order, oldest first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn activity_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<ActivityModel>, ServiceError> {
        let db = &*self.db;

        let exists = OrderEntity::find_by_id(order_id).one(db).await?;
        if exists.is_none() {
            return Err(ServiceError::OrderNotFound(order_id));
        }

        let entries = ActivityEntity::find()
            .filter(order_activity::Column::OrderId.eq(order_id))
            .order_by_asc(order_activity::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(entries)
    }
}
