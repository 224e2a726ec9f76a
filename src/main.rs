use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{info, warn};
use uuid::Uuid;

use marketplace_api as api;

use api::clients::http::{HttpPaymentGateway, HttpSlotAvailability, HttpTaxService};
use api::clients::{GatewaySession, PaymentGateway, SlotAvailability, TaxJurisdiction};
use api::errors::ServiceError;
use api::handlers::AppServices;
use api::services::addresses::AddressService;
use api::services::carts::CartService;
use api::services::checkout::CheckoutService;
use api::services::order_status::OrderStatusService;
use api::services::orders::OrderService;
use api::services::pricing::{PricingService, QuoteCoalescer, StaticTaxTable};
use api::services::reservations::ReservationChecker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await?;
    }
    let db = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    let upstream_timeout = cfg.upstream_timeout();

    let gateway: Arc<dyn PaymentGateway> = match &cfg.payment_gateway_url {
        Some(url) => Arc::new(HttpPaymentGateway::new(
            url.clone(),
            cfg.payment_gateway_secret.clone(),
            upstream_timeout,
        )?),
        None => {
            warn!("No payment gateway configured; session completion will be unavailable");
            Arc::new(UnconfiguredGateway)
        }
    };

    let availability: Arc<dyn SlotAvailability> = match &cfg.availability_url {
        Some(url) => Arc::new(HttpSlotAvailability::new(url.clone(), upstream_timeout)?),
        None => {
            // Absence of confirmation is not a conflict; without a
            // configured source every slot reads as free.
            warn!("No availability service configured; reservation conflicts will not be detected");
            Arc::new(UncheckedAvailability)
        }
    };

    let tax: Arc<dyn TaxJurisdiction> = match &cfg.tax_service_url {
        Some(url) => Arc::new(HttpTaxService::new(url.clone(), upstream_timeout)?),
        None => Arc::new(StaticTaxTable::new(cfg.default_tax_rate)),
    };

    let coalescer = Arc::new(QuoteCoalescer::new());
    let sessions = Arc::new(api::auth::SessionService::new(db.clone()));
    let orders = Arc::new(OrderService::new(db.clone()));
    let order_status = Arc::new(OrderStatusService::new(db.clone(), event_sender.clone()));
    let reservations = Arc::new(ReservationChecker::new(
        db.clone(),
        availability,
        event_sender.clone(),
        coalescer.clone(),
        upstream_timeout,
    ));
    let carts = Arc::new(CartService::new(
        db.clone(),
        event_sender.clone(),
        reservations.clone(),
        coalescer.clone(),
    ));
    let pricing = Arc::new(PricingService::new(
        tax,
        coalescer.clone(),
        cfg.shipping_flat_fee,
        cfg.free_shipping_threshold,
        upstream_timeout,
    ));
    let checkout = Arc::new(CheckoutService::new(
        db.clone(),
        gateway,
        orders.clone(),
        carts.clone(),
        pricing.clone(),
        coalescer,
        event_sender.clone(),
        upstream_timeout,
    ));
    let addresses = Arc::new(AddressService::new(db.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if cfg.reservation_recheck_secs > 0 {
        let sweep = reservations.as_ref().clone();
        let interval = Duration::from_secs(cfg.reservation_recheck_secs);
        tokio::spawn(sweep.run_sweep_loop(interval, shutdown_rx));
    }

    let state = api::AppState {
        db,
        config: cfg.clone(),
        event_sender,
        services: AppServices {
            sessions,
            checkout,
            order_status,
            orders,
            carts,
            addresses,
            pricing,
            reservations,
        },
    };
    let app = api::app_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("marketplace-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    info!("Shutdown complete");
    Ok(())
}

/// Stand-in gateway used when no provider URL is configured.
struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn retrieve_session(&self, _session_id: &str) -> Result<GatewaySession, ServiceError> {
        Err(ServiceError::UpstreamUnavailable(
            "payment gateway is not configured".to_string(),
        ))
    }
}

/// Stand-in availability source that confirms every slot.
struct UncheckedAvailability;

#[async_trait]
impl SlotAvailability for UncheckedAvailability {
    async fn check(&self, _: Uuid, _: &str, _: &str) -> Result<bool, ServiceError> {
        Ok(true)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
