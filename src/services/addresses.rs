use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::shipping_address::{
    self, ActiveModel as AddressActiveModel, Entity as AddressEntity, Model as AddressModel,
};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressRequest {
    #[validate(length(min = 1, max = 255, message = "Street is required"))]
    pub street: String,
    pub apartment: Option<String>,
    #[validate(length(min = 1, max = 120, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, max = 60, message = "State is required"))]
    pub state: String,
    #[validate(length(min = 1, max = 20, message = "Postal code is required"))]
    pub zip: String,
    #[validate(length(min = 2, max = 2, message = "Country must be a two-letter code"))]
    pub country: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub id: Uuid,
    pub street: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
    pub is_default: bool,
}

impl From<AddressModel> for AddressResponse {
    fn from(row: AddressModel) -> Self {
        Self {
            id: row.id,
            street: row.street,
            apartment: row.apartment,
            city: row.city,
            state: row.state,
            zip: row.zip,
            country: row.country,
            is_default: row.is_default,
        }
    }
}

/// Address book for signed-in users.
///
/// At most one persisted address per user is the default; every write that
/// could violate that runs in a transaction that demotes the previous
/// default first. Ad-hoc checkout addresses never pass through here.
#[derive(Clone)]
pub struct AddressService {
    db: Arc<DatabaseConnection>,
}

impl AddressService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The user's addresses, default first, then most recently created.
    #[instrument(skip(self))]
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<AddressResponse>, ServiceError> {
        let db = &*self.db;
        let rows = AddressEntity::find()
            .filter(shipping_address::Column::UserId.eq(user_id))
            .order_by_desc(shipping_address::Column::IsDefault)
            .order_by_desc(shipping_address::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(rows.into_iter().map(AddressResponse::from).collect())
    }

    #[instrument(skip(self, request))]
    pub async fn create(
        &self,
        user_id: Uuid,
        request: AddressRequest,
    ) -> Result<AddressResponse, ServiceError> {
        request.validate()?;

        let db = &*self.db;
        let txn = db.begin().await?;

        let has_any = AddressEntity::find()
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .is_some();
        // A user's first address becomes the default regardless of the flag.
        let make_default = request.is_default || !has_any;
        if make_default {
            Self::demote_default(&txn, user_id).await?;
        }

        let row = AddressActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            street: Set(request.street),
            apartment: Set(request.apartment),
            city: Set(request.city),
            state: Set(request.state),
            zip: Set(request.zip),
            country: Set(request.country.to_uppercase()),
            is_default: Set(make_default),
            ..Default::default()
        };
        let created = row.insert(&txn).await?;
        txn.commit().await?;

        info!(user_id = %user_id, address_id = %created.id, "Address created");
        Ok(created.into())
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        user_id: Uuid,
        address_id: Uuid,
        request: AddressRequest,
    ) -> Result<AddressResponse, ServiceError> {
        request.validate()?;

        let db = &*self.db;
        let txn = db.begin().await?;

        let row = Self::owned_row(&txn, user_id, address_id).await?;
        let was_default = row.is_default;
        if request.is_default && !was_default {
            Self::demote_default(&txn, user_id).await?;
        }

        let mut active: AddressActiveModel = row.into();
        active.street = Set(request.street);
        active.apartment = Set(request.apartment);
        active.city = Set(request.city);
        active.state = Set(request.state);
        active.zip = Set(request.zip);
        active.country = Set(request.country.to_uppercase());
        // Updates can promote to default but never silently demote; that is
        // what set_default on another address is for.
        if request.is_default {
            active.is_default = Set(true);
        }
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        Ok(updated.into())
    }

    /// Make this address the user's single default.
    #[instrument(skip(self))]
    pub async fn set_default(
        &self,
        user_id: Uuid,
        address_id: Uuid,
    ) -> Result<AddressResponse, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await?;

        let row = Self::owned_row(&txn, user_id, address_id).await?;
        if row.is_default {
            txn.commit().await?;
            return Ok(row.into());
        }

        Self::demote_default(&txn, user_id).await?;
        let mut active: AddressActiveModel = row.into();
        active.is_default = Set(true);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(user_id = %user_id, address_id = %address_id, "Default address changed");
        Ok(updated.into())
    }

    /// Delete an address. Deleting the default leaves the user with none.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: Uuid, address_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let row = AddressEntity::find_by_id(address_id)
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Address not found".to_string()))?;
        row.delete(db).await?;
        info!(user_id = %user_id, address_id = %address_id, "Address deleted");
        Ok(())
    }

    async fn owned_row<C: sea_orm::ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        address_id: Uuid,
    ) -> Result<AddressModel, ServiceError> {
        AddressEntity::find_by_id(address_id)
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Address not found".to_string()))
    }

    async fn demote_default<C: sea_orm::ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<(), ServiceError> {
        AddressEntity::update_many()
            .col_expr(
                shipping_address::Column::IsDefault,
                sea_orm::sea_query::Expr::value(false),
            )
            .filter(shipping_address::Column::UserId.eq(user_id))
            .filter(shipping_address::Column::IsDefault.eq(true))
            .exec(conn)
            .await?;
        Ok(())
    }
}
