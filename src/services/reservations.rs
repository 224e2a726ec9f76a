use std::sync::Arc;
use std::time::Duration;

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, QuerySelect,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clients::SlotAvailability;
use crate::entities::cart_item::{self, Entity as CartItemEntity, Model as CartItemModel};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::pricing::QuoteCoalescer;

/// Notice for one reservation item removed from a cart.
///
/// Returned to the caller that triggered the check, exactly once; notices are
/// not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvictedItem {
    pub item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub reservation_date: String,
    pub reservation_time: String,
}

impl EvictedItem {
    fn from_model(item: &CartItemModel) -> Self {
        Self {
            item_id: item.id,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            reservation_date: item.reservation_date.clone().unwrap_or_default(),
            reservation_time: item.reservation_time.clone().unwrap_or_default(),
        }
    }
}

/// Evicts reservation cart items whose slot has been taken.
///
/// Reservation slots are scarce and time-bound; eviction is eager so a user
/// never reaches payment holding a slot that is already gone. A failed or
/// timed-out availability lookup leaves the item in place: absence of
/// confirmation is not a conflict.
#[derive(Clone)]
pub struct ReservationChecker {
    db: Arc<DatabaseConnection>,
    availability: Arc<dyn SlotAvailability>,
    event_sender: Arc<EventSender>,
    coalescer: Arc<QuoteCoalescer>,
    upstream_timeout: Duration,
}

impl ReservationChecker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        availability: Arc<dyn SlotAvailability>,
        event_sender: Arc<EventSender>,
        coalescer: Arc<QuoteCoalescer>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            db,
            availability,
            event_sender,
            coalescer,
            upstream_timeout,
        }
    }

    /// Whether the slot is confirmed free. `None` means the lookup failed.
    async fn slot_available(&self, product_id: Uuid, date: &str, time: &str) -> Option<bool> {
        let check = self.availability.check(product_id, date, time);
        match tokio::time::timeout(self.upstream_timeout, check).await {
            Ok(Ok(available)) => Some(available),
            Ok(Err(e)) => {
                warn!(%product_id, date, time, error = %e, "Slot availability lookup failed");
                None
            }
            Err(_) => {
                warn!(%product_id, date, time, "Slot availability lookup timed out");
                None
            }
        }
    }

    /// Check every reservation item in the owner's cart and evict the ones
    /// whose slot reports unavailable. Returns the eviction notices.
    #[instrument(skip(self))]
    pub async fn check_cart(&self, owner_key: &str) -> Result<Vec<EvictedItem>, ServiceError> {
        let db = &*self.db;
        let items = CartItemEntity::find()
            .filter(cart_item::Column::OwnerKey.eq(owner_key))
            .filter(cart_item::Column::IsReservation.eq(true))
            .all(db)
            .await?;

        let mut evicted = Vec::new();
        for item in items {
            let (date, time) = match (&item.reservation_date, &item.reservation_time) {
                (Some(date), Some(time)) if !date.is_empty() && !time.is_empty() => {
                    (date.clone(), time.clone())
                }
                _ => continue,
            };

            match self.slot_available(item.product_id, &date, &time).await {
                Some(false) => {
                    let notice = EvictedItem::from_model(&item);
                    let item_id = item.id;
                    let product_id = item.product_id;
                    item.delete(db).await?;
                    info!(
                        owner_key,
                        %item_id,
                        %product_id,
                        date,
                        time,
                        "Evicted reservation item with unavailable slot"
                    );
                    self.event_sender
                        .send_or_log(Event::ReservationEvicted {
                            owner_key: owner_key.to_string(),
                            item_id,
                            product_id,
                            reservation_date: date,
                            reservation_time: time,
                        })
                        .await;
                    evicted.push(notice);
                }
                Some(true) | None => {}
            }
        }

        if !evicted.is_empty() {
            self.coalescer.invalidate(owner_key);
        }
        Ok(evicted)
    }

    /// Gate for adding a reservation item: reject when the slot is confirmed
    /// taken. A failed lookup does not block the add; the sweep catches it.
    pub async fn precheck_slot(
        &self,
        product_id: Uuid,
        date: &str,
        time: &str,
    ) -> Result<(), ServiceError> {
        match self.slot_available(product_id, date, time).await {
            Some(false) => Err(ServiceError::ReservationUnavailable(format!(
                "the {} {} slot for this product is no longer available",
                date, time
            ))),
            Some(true) | None => Ok(()),
        }
    }

    /// One pass over every cart holding reservation items.
    async fn sweep_once(&self) {
        let db = &*self.db;
        let owners: Vec<String> = match CartItemEntity::find()
            .select_only()
            .column(cart_item::Column::OwnerKey)
            .filter(cart_item::Column::IsReservation.eq(true))
            .distinct()
            .into_tuple()
            .all(db)
            .await
        {
            Ok(owners) => owners,
            Err(e) => {
                warn!(error = %e, "Reservation sweep could not list carts");
                return;
            }
        };

        for owner_key in owners {
            match self.check_cart(&owner_key).await {
                Ok(evicted) if !evicted.is_empty() => {
                    info!(owner_key, count = evicted.len(), "Sweep evicted reservation items");
                }
                Ok(_) => {}
                Err(e) => warn!(owner_key, error = %e, "Reservation sweep failed for cart"),
            }
        }
    }

    /// Periodic sweep, re-armed only after the previous run completes so runs
    /// never overlap. Stopped through the shutdown channel.
    pub async fn run_sweep_loop(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Reservation sweep started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("Reservation sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, Set};
    use std::collections::HashSet;

    struct ScriptedAvailability {
        unavailable: HashSet<Uuid>,
    }

    #[async_trait]
    impl SlotAvailability for ScriptedAvailability {
        async fn check(&self, product_id: Uuid, _: &str, _: &str) -> Result<bool, ServiceError> {
            Ok(!self.unavailable.contains(&product_id))
        }
    }

    struct FailingAvailability;

    #[async_trait]
    impl SlotAvailability for FailingAvailability {
        async fn check(&self, _: Uuid, _: &str, _: &str) -> Result<bool, ServiceError> {
            Err(ServiceError::UpstreamUnavailable(
                "availability service returned 502".to_string(),
            ))
        }
    }

    async fn setup(
        availability: Arc<dyn SlotAvailability>,
    ) -> (tempfile::TempDir, Arc<DatabaseConnection>, ReservationChecker) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("carts.db").display());
        let db = Arc::new(crate::db::establish_connection(&url).await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let checker = ReservationChecker::new(
            db.clone(),
            availability,
            Arc::new(EventSender::new(tx)),
            Arc::new(QuoteCoalescer::new()),
            Duration::from_millis(250),
        );
        (dir, db, checker)
    }

    async fn seed_item(
        db: &DatabaseConnection,
        owner_key: &str,
        product_id: Uuid,
        reservation: Option<(&str, &str)>,
    ) -> CartItemModel {
        let item = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_key: Set(owner_key.to_string()),
            store_id: Set(Uuid::new_v4()),
            store_name: Set("Test Store".to_string()),
            product_id: Set(product_id),
            product_name: Set("Dinner for Two".to_string()),
            product_image: Set(None),
            quantity: Set(1),
            unit_price: Set(dec!(30.00)),
            is_reservation: Set(reservation.is_some()),
            reservation_date: Set(reservation.map(|(d, _)| d.to_string())),
            reservation_time: Set(reservation.map(|(_, t)| t.to_string())),
            reservation_notes: Set(None),
            created_at: NotSet,
            updated_at: NotSet,
        };
        item.insert(db).await.unwrap()
    }

    async fn cart_size(db: &DatabaseConnection, owner_key: &str) -> usize {
        CartItemEntity::find()
            .filter(cart_item::Column::OwnerKey.eq(owner_key))
            .all(db)
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn evicts_unavailable_slot_and_reports_it_exactly_once() {
        let gone = Uuid::new_v4();
        let (_dir, db, checker) = setup(Arc::new(ScriptedAvailability {
            unavailable: HashSet::from([gone]),
        }))
        .await;

        seed_item(&db, "user:alice", gone, Some(("2025-07-04", "18:30"))).await;
        seed_item(&db, "user:alice", Uuid::new_v4(), Some(("2025-07-04", "20:00"))).await;

        let evicted = checker.check_cart("user:alice").await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].product_id, gone);
        assert_eq!(evicted[0].reservation_date, "2025-07-04");
        assert_eq!(cart_size(&db, "user:alice").await, 1);

        // The notice is not repeated on the next check.
        let again = checker.check_cart("user:alice").await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_leaves_the_item_in_the_cart() {
        let (_dir, db, checker) = setup(Arc::new(FailingAvailability)).await;
        seed_item(&db, "user:bob", Uuid::new_v4(), Some(("2025-08-01", "12:00"))).await;

        let evicted = checker.check_cart("user:bob").await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cart_size(&db, "user:bob").await, 1);
    }

    #[tokio::test]
    async fn physical_items_are_never_checked() {
        let gone = Uuid::new_v4();
        let (_dir, db, checker) = setup(Arc::new(ScriptedAvailability {
            unavailable: HashSet::from([gone]),
        }))
        .await;

        // Same product id, but a quantity-only line.
        seed_item(&db, "guest:tok-1", gone, None).await;

        let evicted = checker.check_cart("guest:tok-1").await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cart_size(&db, "guest:tok-1").await, 1);
    }

    #[tokio::test]
    async fn reservation_without_slot_fields_is_skipped() {
        let gone = Uuid::new_v4();
        let (_dir, db, checker) = setup(Arc::new(ScriptedAvailability {
            unavailable: HashSet::from([gone]),
        }))
        .await;

        let item = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_key: Set("user:carol".to_string()),
            store_id: Set(Uuid::new_v4()),
            store_name: Set("Test Store".to_string()),
            product_id: Set(gone),
            product_name: Set("Open Voucher".to_string()),
            product_image: Set(None),
            quantity: Set(1),
            unit_price: Set(dec!(15.00)),
            is_reservation: Set(true),
            reservation_date: Set(None),
            reservation_time: Set(None),
            reservation_notes: Set(None),
            created_at: NotSet,
            updated_at: NotSet,
        };
        item.insert(&*db).await.unwrap();

        let evicted = checker.check_cart("user:carol").await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cart_size(&db, "user:carol").await, 1);
    }

    #[tokio::test]
    async fn precheck_rejects_taken_slot_but_tolerates_lookup_failure() {
        let gone = Uuid::new_v4();
        let (_dir, _db, checker) = setup(Arc::new(ScriptedAvailability {
            unavailable: HashSet::from([gone]),
        }))
        .await;

        let err = checker
            .precheck_slot(gone, "2025-07-04", "18:30")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ReservationUnavailable(_)));

        assert!(checker
            .precheck_slot(Uuid::new_v4(), "2025-07-04", "18:30")
            .await
            .is_ok());

        let (_dir2, _db2, failing) = setup(Arc::new(FailingAvailability)).await;
        assert!(failing
            .precheck_slot(Uuid::new_v4(), "2025-07-04", "18:30")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn sweep_loop_evicts_and_stops_on_shutdown() {
        let gone = Uuid::new_v4();
        let (_dir, db, checker) = setup(Arc::new(ScriptedAvailability {
            unavailable: HashSet::from([gone]),
        }))
        .await;
        seed_item(&db, "user:dave", gone, Some(("2025-09-10", "19:00"))).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            checker
                .clone()
                .run_sweep_loop(Duration::from_millis(25), shutdown_rx),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cart_size(&db, "user:dave").await, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
