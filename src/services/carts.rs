use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::cart_item::{
    self, ActiveModel as CartItemActiveModel, Entity as CartItemEntity, Model as CartItemModel,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::pricing::{PricingBreakdown, QuoteCoalescer};
use crate::services::reservations::{EvictedItem, ReservationChecker};

/// The party a cart belongs to: a signed-in user or a guest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOwner {
    User(Uuid),
    Guest(String),
}

impl CartOwner {
    /// Storage key for the owner's cart rows.
    pub fn key(&self) -> String {
        match self {
            CartOwner::User(id) => format!("user:{}", id),
            CartOwner::Guest(token) => format!("guest:{}", token),
        }
    }
}

impl fmt::Display for CartOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddItemRequest {
    pub store_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "Store name is required"))]
    pub store_name: String,
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "Product name is required"))]
    pub product_name: String,
    pub product_image: Option<String>,
    #[validate(range(min = 1, max = 999, message = "Quantity must be between 1 and 999"))]
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(default)]
    pub is_reservation: bool,
    pub reservation_date: Option<String>,
    pub reservation_time: Option<String>,
    pub reservation_notes: Option<String>,
}

/// One cart line as rendered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartItemView {
    pub id: Uuid,
    pub store_id: Uuid,
    pub store_name: String,
    pub product_id: Uuid,
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_image: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub is_reservation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_notes: Option<String>,
}

impl From<CartItemModel> for CartItemView {
    fn from(item: CartItemModel) -> Self {
        Self {
            id: item.id,
            store_id: item.store_id,
            store_name: item.store_name,
            product_id: item.product_id,
            product_name: item.product_name,
            product_image: item.product_image,
            quantity: item.quantity,
            unit_price: item.unit_price,
            is_reservation: item.is_reservation,
            reservation_date: item.reservation_date,
            reservation_time: item.reservation_time,
            reservation_notes: item.reservation_notes,
        }
    }
}

/// A cart as returned from every cart endpoint.
///
/// `subtotal` is the local display figure; `quote` is the last authoritative
/// breakdown that survived the pricing generation check, when one exists.
/// `evictions` carries reservation items removed by the check this call
/// triggered, surfaced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartItemView>,
    pub subtotal: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<PricingBreakdown>,
    pub evictions: Vec<EvictedItem>,
}

#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    checker: Arc<ReservationChecker>,
    coalescer: Arc<QuoteCoalescer>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        checker: Arc<ReservationChecker>,
        coalescer: Arc<QuoteCoalescer>,
    ) -> Self {
        Self {
            db,
            event_sender,
            checker,
            coalescer,
        }
    }

    /// Raw cart rows for an owner, oldest first. Used by checkout completion.
    pub async fn items(&self, owner_key: &str) -> Result<Vec<CartItemModel>, ServiceError> {
        let db = &*self.db;
        let items = CartItemEntity::find()
            .filter(cart_item::Column::OwnerKey.eq(owner_key))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(items)
    }

    fn local_subtotal(items: &[CartItemModel]) -> Decimal {
        items
            .iter()
            .map(|item| item.unit_price * Decimal::from(item.quantity))
            .sum()
    }

    async fn view(
        &self,
        owner_key: &str,
        evictions: Vec<EvictedItem>,
    ) -> Result<CartView, ServiceError> {
        let items = self.items(owner_key).await?;
        let subtotal = Self::local_subtotal(&items);
        Ok(CartView {
            items: items.into_iter().map(CartItemView::from).collect(),
            subtotal,
            quote: self.coalescer.latest(owner_key),
            evictions,
        })
    }

    /// Conflict-check plus quote invalidation, run after every mutation.
    async fn after_mutation(&self, owner_key: &str) -> Result<Vec<EvictedItem>, ServiceError> {
        self.coalescer.invalidate(owner_key);
        self.checker.check_cart(owner_key).await
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn get_cart(&self, owner: &CartOwner) -> Result<CartView, ServiceError> {
        self.view(&owner.key(), Vec::new()).await
    }

    /// Add an item, merging quantity into an existing line for the same
    /// product and slot. Reservation items are gated on a slot pre-check.
    #[instrument(skip(self, request), fields(owner = %owner, product_id = %request.product_id))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        request: AddItemRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        if request.unit_price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "unit price must not be negative".to_string(),
            ));
        }

        let owner_key = owner.key();

        if request.is_reservation {
            if let (Some(date), Some(time)) = (&request.reservation_date, &request.reservation_time)
            {
                if !date.is_empty() && !time.is_empty() {
                    self.checker
                        .precheck_slot(request.product_id, date, time)
                        .await?;
                }
            }
        }

        let db = &*self.db;
        let mut lookup = CartItemEntity::find()
            .filter(cart_item::Column::OwnerKey.eq(owner_key.as_str()))
            .filter(cart_item::Column::StoreId.eq(request.store_id))
            .filter(cart_item::Column::ProductId.eq(request.product_id))
            .filter(cart_item::Column::IsReservation.eq(request.is_reservation));
        lookup = match &request.reservation_date {
            Some(date) => lookup.filter(cart_item::Column::ReservationDate.eq(date.clone())),
            None => lookup.filter(cart_item::Column::ReservationDate.is_null()),
        };
        lookup = match &request.reservation_time {
            Some(time) => lookup.filter(cart_item::Column::ReservationTime.eq(time.clone())),
            None => lookup.filter(cart_item::Column::ReservationTime.is_null()),
        };
        let existing = lookup.one(db).await?;

        match existing {
            Some(item) => {
                let merged = item.quantity + request.quantity;
                let mut active: CartItemActiveModel = item.into();
                active.quantity = Set(merged);
                active.unit_price = Set(request.unit_price);
                active.updated_at = Set(Some(chrono::Utc::now()));
                active.update(db).await?;
            }
            None => {
                let item = CartItemActiveModel {
                    id: Set(Uuid::new_v4()),
                    owner_key: Set(owner_key.clone()),
                    store_id: Set(request.store_id),
                    store_name: Set(request.store_name.clone()),
                    product_id: Set(request.product_id),
                    product_name: Set(request.product_name.clone()),
                    product_image: Set(request.product_image.clone()),
                    quantity: Set(request.quantity),
                    unit_price: Set(request.unit_price),
                    is_reservation: Set(request.is_reservation),
                    reservation_date: Set(request.reservation_date.clone()),
                    reservation_time: Set(request.reservation_time.clone()),
                    reservation_notes: Set(request.reservation_notes.clone()),
                    ..Default::default()
                };
                item.insert(db).await?;
            }
        }

        info!(owner_key, product_id = %request.product_id, "Cart item added");
        self.event_sender
            .send_or_log(Event::CartItemAdded {
                owner_key: owner_key.clone(),
                product_id: request.product_id,
                quantity: request.quantity,
            })
            .await;

        let evictions = self.after_mutation(&owner_key).await?;
        self.view(&owner_key, evictions).await
    }

    /// Set a line's quantity; zero or below removes the line.
    #[instrument(skip(self), fields(owner = %owner, item_id = %item_id))]
    pub async fn update_quantity(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return self.remove_item(owner, item_id).await;
        }
        if quantity > 999 {
            return Err(ServiceError::ValidationError(
                "Quantity must be between 1 and 999".to_string(),
            ));
        }

        let owner_key = owner.key();
        let db = &*self.db;
        let item = CartItemEntity::find_by_id(item_id)
            .filter(cart_item::Column::OwnerKey.eq(owner_key.as_str()))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart item not found".to_string()))?;

        let mut active: CartItemActiveModel = item.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Some(chrono::Utc::now()));
        active.update(db).await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                owner_key: owner_key.clone(),
                item_id,
                quantity,
            })
            .await;

        let evictions = self.after_mutation(&owner_key).await?;
        self.view(&owner_key, evictions).await
    }

    #[instrument(skip(self), fields(owner = %owner, item_id = %item_id))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let owner_key = owner.key();
        let db = &*self.db;
        let item = CartItemEntity::find_by_id(item_id)
            .filter(cart_item::Column::OwnerKey.eq(owner_key.as_str()))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart item not found".to_string()))?;

        item.delete(db).await?;
        info!(owner_key, %item_id, "Cart item removed");

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                owner_key: owner_key.clone(),
                item_id,
            })
            .await;

        let evictions = self.after_mutation(&owner_key).await?;
        self.view(&owner_key, evictions).await
    }

    /// Remove every line in the owner's cart.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn clear(&self, owner: &CartOwner) -> Result<CartView, ServiceError> {
        let owner_key = owner.key();
        self.clear_by_key(&owner_key).await?;

        self.event_sender
            .send_or_log(Event::CartCleared {
                owner_key: owner_key.clone(),
            })
            .await;

        self.view(&owner_key, Vec::new()).await
    }

    /// Delete all rows for an owner key without emitting cart events.
    async fn clear_by_key(&self, owner_key: &str) -> Result<(), ServiceError> {
        let db = &*self.db;
        CartItemEntity::delete_many()
            .filter(cart_item::Column::OwnerKey.eq(owner_key))
            .exec(db)
            .await?;
        self.coalescer.invalidate(owner_key);
        Ok(())
    }

    /// Run the conflict checker on demand, surfacing evictions once.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn reservation_check(&self, owner: &CartOwner) -> Result<CartView, ServiceError> {
        let owner_key = owner.key();
        let evictions = self.checker.check_cart(&owner_key).await?;
        self.view(&owner_key, evictions).await
    }
}
