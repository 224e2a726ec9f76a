use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clients::{AddressSnapshot, GatewaySession, PaymentGateway, PaymentState};
use crate::entities::cart_item::{self, Entity as CartItemEntity, Model as CartItemModel};
use crate::entities::{order, order_item};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::carts::CartService;
use crate::services::order_status::OrderStatus;
use crate::services::orders::OrderService;
use crate::services::pricing::{AddressInput, PricingItem, PricingService, QuoteCoalescer};

/// The caller's proof of identity for resolution purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(Uuid),
    Guest(String),
    Anonymous,
}

impl Identity {
    fn cart_owner_key(&self) -> Option<String> {
        match self {
            Identity::User(id) => Some(format!("user:{}", id)),
            Identity::Guest(token) => Some(format!("guest:{}", token)),
            Identity::Anonymous => None,
        }
    }
}

/// Identifiers a caller may hand to the resolver. First applicable wins:
/// explicit ids, then payment intent, then checkout session.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub explicit_order_ids: Option<String>,
    pub payment_intent_id: Option<String>,
    pub session_id: Option<String>,
}

/// Outcome of a resolution attempt. `success: false` is the only failure
/// signal; the resolver never raises past its boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_ids: Option<Vec<String>>,
}

impl CompletionOutcome {
    fn resolved(order_ids: Vec<String>) -> Self {
        Self {
            success: true,
            message: None,
            order_ids: Some(order_ids),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            order_ids: None,
        }
    }
}

/// Turns a payment signal into an authoritative set of order ids, creating
/// the orders when the signal is a checkout session.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    orders: Arc<OrderService>,
    carts: Arc<CartService>,
    pricing: Arc<PricingService>,
    coalescer: Arc<QuoteCoalescer>,
    event_sender: Arc<EventSender>,
    completion_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    upstream_timeout: Duration,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        orders: Arc<OrderService>,
        carts: Arc<CartService>,
        pricing: Arc<PricingService>,
        coalescer: Arc<QuoteCoalescer>,
        event_sender: Arc<EventSender>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            orders,
            carts,
            pricing,
            coalescer,
            event_sender,
            completion_locks: Arc::new(DashMap::new()),
            upstream_timeout,
        }
    }

    /// Resolve a completion request to order ids.
    ///
    /// Never returns an error: anything that goes wrong downgrades to
    /// `success: false` with a message, because the payment may have gone
    /// through even when resolution fails and the caller must be able to
    /// recover by re-resolving.
    #[instrument(skip(self, request))]
    pub async fn resolve(
        &self,
        identity: &Identity,
        request: &CompletionRequest,
    ) -> CompletionOutcome {
        if *identity == Identity::Anonymous {
            return CompletionOutcome::failed("authentication required");
        }

        if let Some(raw) = non_blank(request.explicit_order_ids.as_deref()) {
            let ids: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            return CompletionOutcome::resolved(ids);
        }

        if let Some(intent) = non_blank(request.payment_intent_id.as_deref()) {
            let user_scope = match identity {
                Identity::User(id) => Some(*id),
                _ => None,
            };
            return match self.orders.find_by_payment_intent(intent, user_scope).await {
                Ok(orders) => CompletionOutcome::resolved(
                    orders.iter().map(|o| o.id.to_string()).collect(),
                ),
                Err(e) => {
                    warn!(error = %e, "Payment-intent lookup failed during resolution");
                    CompletionOutcome::failed(e.response_message())
                }
            };
        }

        if let Some(session_id) = non_blank(request.session_id.as_deref()) {
            return match self.complete_session(identity, session_id).await {
                Ok(order_ids) => CompletionOutcome::resolved(
                    order_ids.iter().map(Uuid::to_string).collect(),
                ),
                Err(e) => {
                    warn!(error = %e, session_id, "Checkout-session completion failed");
                    CompletionOutcome::failed(e.response_message())
                }
            };
        }

        CompletionOutcome::failed(ServiceError::MissingCheckoutIdentifier.to_string())
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
        let retrieval = self.gateway.retrieve_session(session_id);
        match tokio::time::timeout(self.upstream_timeout, retrieval).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::UpstreamUnavailable(
                "payment gateway timed out".to_string(),
            )),
        }
    }

    /// Materialize orders for a paid checkout session.
    ///
    /// Re-running with the same session returns the previously created
    /// orders: the payment intent carried by the session is looked up before
    /// anything is written, and concurrent completions of one intent are
    /// serialized on a per-intent lock.
    #[instrument(skip(self, identity))]
    pub async fn complete_session(
        &self,
        identity: &Identity,
        session_id: &str,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let session = self.retrieve_session(session_id).await?;

        let caller_key = identity
            .cart_owner_key()
            .ok_or(ServiceError::AuthenticationRequired)?;
        if session.cart_owner_key != caller_key {
            return Err(ServiceError::Forbidden(
                "checkout session does not belong to this caller".to_string(),
            ));
        }

        if session.payment_state != PaymentState::Paid {
            return Err(ServiceError::ValidationError(format!(
                "checkout session {} is not paid",
                session_id
            )));
        }

        let lock = self
            .completion_locks
            .entry(session.payment_intent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let existing = self
            .orders
            .find_by_payment_intent(&session.payment_intent_id, None)
            .await?;
        if !existing.is_empty() {
            info!(
                payment_intent_id = %session.payment_intent_id,
                count = existing.len(),
                "Checkout session already materialized"
            );
            return Ok(existing.iter().map(|o| o.id).collect());
        }

        let items = self.carts.items(&session.cart_owner_key).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "no cart items to complete checkout for".to_string(),
            ));
        }

        let shipping = session.shipping_address.as_ref().ok_or_else(|| {
            ServiceError::ValidationError(
                "checkout session carries no shipping address".to_string(),
            )
        })?;
        let destination = AddressInput {
            zip: shipping.zip.clone(),
            state: shipping.state.clone(),
            country: shipping.country.clone(),
        };

        // Multi-store carts become one order per store, sharing the payment
        // intent. Pricing runs per store group, and all upstream lookups
        // finish before the write transaction opens.
        let mut groups: BTreeMap<Uuid, Vec<CartItemModel>> = BTreeMap::new();
        for item in items {
            groups.entry(item.store_id).or_default().push(item);
        }

        let mut priced_groups = Vec::with_capacity(groups.len());
        for (store_id, group) in groups {
            let pricing_items: Vec<PricingItem> = group
                .iter()
                .map(|item| PricingItem {
                    price: item.unit_price,
                    quantity: item.quantity.max(0) as u32,
                })
                .collect();
            let breakdown = self.pricing.compute(&pricing_items, &destination).await?;
            priced_groups.push((store_id, group, breakdown));
        }

        let user_id = match identity {
            Identity::User(id) => Some(*id),
            _ => None,
        };
        let address_snapshot = serialize_address(shipping)?;
        let now = Utc::now();

        let db = &*self.db;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        let mut created = Vec::with_capacity(priced_groups.len());
        for (store_id, group, breakdown) in priced_groups {
            let order_id = Uuid::new_v4();
            let order_row = order::ActiveModel {
                id: Set(order_id),
                order_number: Set(generate_order_number()),
                user_id: Set(user_id),
                store_id: Set(store_id),
                status: Set(OrderStatus::Pending.to_string()),
                order_date: Set(now),
                subtotal: Set(breakdown.subtotal),
                tax_amount: Set(breakdown.tax_amount),
                tax_rate: Set(breakdown.tax_rate),
                shipping_amount: Set(breakdown.shipping_amount),
                total_amount: Set(breakdown.total),
                total_refunded: Set(None),
                currency: Set("USD".to_string()),
                payment_method: Set(session.payment_method.clone()),
                payment_intent_id: Set(Some(session.payment_intent_id.clone())),
                shipping_address: Set(Some(address_snapshot.clone())),
                tracking_number: Set(None),
                shipped_date: Set(None),
                delivered_date: Set(None),
                created_at: Set(now),
                updated_at: Set(Some(now)),
                version: Set(1),
            };
            order_row.insert(&txn).await.map_err(|e| {
                error!(error = %e, %order_id, "Failed to insert order");
                ServiceError::DatabaseError(e)
            })?;

            for item in &group {
                let line = order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order_id),
                    product_id: Set(item.product_id),
                    product_name: Set(item.product_name.clone()),
                    product_image: Set(item.product_image.clone()),
                    quantity: Set(item.quantity),
                    unit_price: Set(item.unit_price),
                    subtotal: Set(item.unit_price * rust_decimal::Decimal::from(item.quantity)),
                    is_reservation: Set(item.is_reservation),
                    reservation_date: Set(item.reservation_date.clone()),
                    reservation_time: Set(item.reservation_time.clone()),
                    reservation_notes: Set(item.reservation_notes.clone()),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                };
                line.insert(&txn).await.map_err(|e| {
                    error!(error = %e, %order_id, "Failed to insert order item");
                    ServiceError::DatabaseError(e)
                })?;
            }
            created.push(order_id);
        }

        CartItemEntity::delete_many()
            .filter(cart_item::Column::OwnerKey.eq(session.cart_owner_key.as_str()))
            .exec(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to clear cart during checkout");
                ServiceError::DatabaseError(e)
            })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit checkout transaction");
            ServiceError::DatabaseError(e)
        })?;

        self.coalescer.invalidate(&session.cart_owner_key);

        info!(
            payment_intent_id = %session.payment_intent_id,
            orders = created.len(),
            "Checkout session materialized"
        );
        for order_id in &created {
            self.event_sender
                .send_or_log(Event::OrderCreated(*order_id))
                .await;
        }
        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                payment_intent_id: session.payment_intent_id.clone(),
                order_ids: created.clone(),
            })
            .await;

        Ok(created)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn generate_order_number() -> String {
    format!(
        "ORD-{}",
        &Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

fn serialize_address(address: &AddressSnapshot) -> Result<String, ServiceError> {
    serde_json::to_string(address)
        .map_err(|e| ServiceError::InternalError(format!("failed to serialize address: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::clients::SlotAvailability;
    use crate::services::pricing::StaticTaxTable;
    use crate::services::reservations::ReservationChecker;

    struct ScriptedGateway {
        sessions: HashMap<String, GatewaySession>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(sessions: Vec<GatewaySession>) -> Self {
            Self {
                sessions: sessions.into_iter().map(|s| (s.id.clone(), s)).collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| ServiceError::UpstreamUnavailable("gateway offline".to_string()))
        }
    }

    struct AlwaysAvailable;

    #[async_trait]
    impl SlotAvailability for AlwaysAvailable {
        async fn check(&self, _: Uuid, _: &str, _: &str) -> Result<bool, ServiceError> {
            Ok(true)
        }
    }

    fn manhattan() -> AddressSnapshot {
        AddressSnapshot {
            street: "350 Fifth Ave".to_string(),
            apartment: None,
            city: "New York".to_string(),
            state: "NY".to_string(),
            zip: "10001".to_string(),
            country: "US".to_string(),
        }
    }

    fn paid_session(id: &str, intent: &str, owner_key: &str) -> GatewaySession {
        GatewaySession {
            id: id.to_string(),
            payment_state: PaymentState::Paid,
            payment_intent_id: intent.to_string(),
            cart_owner_key: owner_key.to_string(),
            payment_method: Some("card".to_string()),
            shipping_address: Some(manhattan()),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<DatabaseConnection>,
        carts: Arc<CartService>,
        service: CheckoutService,
        gateway: Arc<ScriptedGateway>,
    }

    async fn setup(gateway: ScriptedGateway) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("checkout.db").display()
        );
        let db = Arc::new(crate::db::establish_connection(&url).await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let sender = Arc::new(EventSender::new(tx));
        let coalescer = Arc::new(QuoteCoalescer::new());
        let checker = Arc::new(ReservationChecker::new(
            db.clone(),
            Arc::new(AlwaysAvailable),
            sender.clone(),
            coalescer.clone(),
            Duration::from_millis(250),
        ));
        let carts = Arc::new(CartService::new(
            db.clone(),
            sender.clone(),
            checker,
            coalescer.clone(),
        ));
        let orders = Arc::new(OrderService::new(db.clone()));
        let pricing = Arc::new(PricingService::new(
            Arc::new(StaticTaxTable::new(dec!(0.08))),
            coalescer.clone(),
            dec!(5.99),
            dec!(50.00),
            Duration::from_millis(250),
        ));
        let gateway = Arc::new(gateway);
        let service = CheckoutService::new(
            db.clone(),
            gateway.clone(),
            orders,
            carts.clone(),
            pricing,
            coalescer,
            sender,
            Duration::from_millis(250),
        );
        Harness {
            _dir: dir,
            db,
            carts,
            service,
            gateway,
        }
    }

    async fn seed_cart_item(
        db: &DatabaseConnection,
        owner_key: &str,
        store_id: Uuid,
        price: rust_decimal::Decimal,
        quantity: i32,
    ) {
        let item = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_key: Set(owner_key.to_string()),
            store_id: Set(store_id),
            store_name: Set("Corner Deli".to_string()),
            product_id: Set(Uuid::new_v4()),
            product_name: Set("Olive Oil".to_string()),
            product_image: Set(None),
            quantity: Set(quantity),
            unit_price: Set(price),
            is_reservation: Set(false),
            reservation_date: Set(None),
            reservation_time: Set(None),
            reservation_notes: Set(None),
            ..Default::default()
        };
        item.insert(db).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_ids_win_over_everything_and_touch_nothing() {
        let h = setup(ScriptedGateway::empty()).await;
        let identity = Identity::User(Uuid::new_v4());

        let outcome = h
            .service
            .resolve(
                &identity,
                &CompletionRequest {
                    explicit_order_ids: Some(" ord-a, ,ord-b,,".to_string()),
                    payment_intent_id: Some("pi_ignored".to_string()),
                    session_id: Some("cs_ignored".to_string()),
                },
            )
            .await;

        assert!(outcome.success);
        assert_eq!(
            outcome.order_ids.unwrap(),
            vec!["ord-a".to_string(), "ord-b".to_string()]
        );
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn anonymous_callers_fail_before_any_branch() {
        let h = setup(ScriptedGateway::empty()).await;
        let outcome = h
            .service
            .resolve(
                &Identity::Anonymous,
                &CompletionRequest {
                    explicit_order_ids: Some("ord-a".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("authentication required"));
        assert!(outcome.order_ids.is_none());
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_identifier_fails_with_missing_identifier_message() {
        let h = setup(ScriptedGateway::empty()).await;
        let outcome = h
            .service
            .resolve(&Identity::User(Uuid::new_v4()), &CompletionRequest::default())
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.message.as_deref(),
            Some(ServiceError::MissingCheckoutIdentifier.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn session_completion_creates_one_order_per_store_and_clears_the_cart() {
        let user_id = Uuid::new_v4();
        let owner_key = format!("user:{}", user_id);
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_1", "pi_1", &owner_key,
        )]))
        .await;

        let store_a = Uuid::new_v4();
        let store_b = Uuid::new_v4();
        seed_cart_item(&h.db, &owner_key, store_a, dec!(21.00), 2).await;
        seed_cart_item(&h.db, &owner_key, store_b, dec!(61.50), 1).await;

        let identity = Identity::User(user_id);
        let outcome = h
            .service
            .resolve(
                &identity,
                &CompletionRequest {
                    session_id: Some("cs_1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(outcome.success, "completion failed: {:?}", outcome.message);
        let ids = outcome.order_ids.unwrap();
        assert_eq!(ids.len(), 2);

        let orders = order::Entity::find().all(&*h.db).await.unwrap();
        assert_eq!(orders.len(), 2);
        for persisted in &orders {
            assert_eq!(persisted.status, "pending");
            assert_eq!(persisted.user_id, Some(user_id));
            assert_eq!(persisted.payment_intent_id.as_deref(), Some("pi_1"));
            assert!(persisted.order_number.starts_with("ORD-"));
        }

        // Store A: $42.00 below the threshold, NYC tax rate.
        let a = orders.iter().find(|o| o.store_id == store_a).unwrap();
        assert_eq!(a.subtotal, dec!(42.00));
        assert_eq!(a.tax_rate, dec!(0.08875));
        assert_eq!(a.tax_amount, dec!(3.73));
        assert_eq!(a.shipping_amount, dec!(5.99));
        assert_eq!(a.total_amount, dec!(51.72));

        // Store B: $61.50 clears the free-shipping threshold.
        let b = orders.iter().find(|o| o.store_id == store_b).unwrap();
        assert_eq!(b.shipping_amount, dec!(0));
        assert_eq!(b.total_amount, dec!(66.96));

        let items = order_item::Entity::find().all(&*h.db).await.unwrap();
        assert_eq!(items.len(), 2);

        assert!(h.carts.items(&owner_key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeating_a_session_returns_the_same_orders() {
        let user_id = Uuid::new_v4();
        let owner_key = format!("user:{}", user_id);
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_1", "pi_1", &owner_key,
        )]))
        .await;
        seed_cart_item(&h.db, &owner_key, Uuid::new_v4(), dec!(10.00), 1).await;

        let identity = Identity::User(user_id);
        let request = CompletionRequest {
            session_id: Some("cs_1".to_string()),
            ..Default::default()
        };

        let first = h.service.resolve(&identity, &request).await;
        let second = h.service.resolve(&identity, &request).await;

        assert!(first.success && second.success);
        assert_eq!(first.order_ids, second.order_ids);
        assert_eq!(order::Entity::find().all(&*h.db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn payment_intent_resolution_is_scoped_to_the_user() {
        let user_id = Uuid::new_v4();
        let owner_key = format!("user:{}", user_id);
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_1", "pi_1", &owner_key,
        )]))
        .await;
        seed_cart_item(&h.db, &owner_key, Uuid::new_v4(), dec!(10.00), 1).await;

        let identity = Identity::User(user_id);
        h.service
            .resolve(
                &identity,
                &CompletionRequest {
                    session_id: Some("cs_1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let by_intent = CompletionRequest {
            payment_intent_id: Some("pi_1".to_string()),
            ..Default::default()
        };
        let mine = h.service.resolve(&identity, &by_intent).await;
        assert!(mine.success);
        assert_eq!(mine.order_ids.as_ref().unwrap().len(), 1);

        // Another signed-in user resolving the same intent sees nothing.
        let stranger = h
            .service
            .resolve(&Identity::User(Uuid::new_v4()), &by_intent)
            .await;
        assert!(stranger.success);
        assert!(stranger.order_ids.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpaid_session_downgrades_to_failure() {
        let user_id = Uuid::new_v4();
        let owner_key = format!("user:{}", user_id);
        let mut session = paid_session("cs_1", "pi_1", &owner_key);
        session.payment_state = PaymentState::Unpaid;
        let h = setup(ScriptedGateway::new(vec![session])).await;
        seed_cart_item(&h.db, &owner_key, Uuid::new_v4(), dec!(10.00), 1).await;

        let outcome = h
            .service
            .resolve(
                &Identity::User(user_id),
                &CompletionRequest {
                    session_id: Some("cs_1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("not paid"));
        assert!(order::Entity::find().all(&*h.db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_downgrades_to_failure_with_upstream_text() {
        let h = setup(ScriptedGateway::empty()).await;
        let outcome = h
            .service
            .resolve(
                &Identity::User(Uuid::new_v4()),
                &CompletionRequest {
                    session_id: Some("cs_down".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("gateway offline"));
    }

    #[tokio::test]
    async fn sessions_of_other_callers_are_rejected() {
        let owner = Uuid::new_v4();
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_1",
            "pi_1",
            &format!("user:{}", owner),
        )]))
        .await;

        let outcome = h
            .service
            .resolve(
                &Identity::User(Uuid::new_v4()),
                &CompletionRequest {
                    session_id: Some("cs_1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("does not belong"));
    }

    #[tokio::test]
    async fn guest_sessions_materialize_ownerless_orders() {
        let owner_key = "guest:tok-99".to_string();
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_g", "pi_g", &owner_key,
        )]))
        .await;
        seed_cart_item(&h.db, &owner_key, Uuid::new_v4(), dec!(15.00), 1).await;

        let outcome = h
            .service
            .resolve(
                &Identity::Guest("tok-99".to_string()),
                &CompletionRequest {
                    session_id: Some("cs_g".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(outcome.success);
        let orders = order::Entity::find().all(&*h.db).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].user_id, None);
    }

    #[tokio::test]
    async fn empty_cart_with_no_orders_downgrades_to_failure() {
        let user_id = Uuid::new_v4();
        let owner_key = format!("user:{}", user_id);
        let h = setup(ScriptedGateway::new(vec![paid_session(
            "cs_1", "pi_1", &owner_key,
        )]))
        .await;

        let outcome = h
            .service
            .resolve(
                &Identity::User(user_id),
                &CompletionRequest {
                    session_id: Some("cs_1".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("no cart items"));
    }
}
