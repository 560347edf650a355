use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};

use storefront_api as api;
use api::cache::{CacheService, RedisCacheBackend};
use api::payments::{StripeClient, StripeConfig, WebhookVerifier};
use api::repositories::{DeadLetterRepository, OrderRepository, ProductRepository};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_with_config(&api::db::DbConfig::from(&cfg)).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Cache: an unreachable Redis disables caching instead of failing startup
    let cache = match cfg.redis_url() {
        Some(url) => match RedisCacheBackend::connect(url).await {
            Ok(backend) => CacheService::new(Arc::new(backend)),
            Err(e) => {
                warn!(error = %e, "Redis unavailable; running with cache disabled");
                CacheService::disabled()
            }
        },
        None => CacheService::disabled(),
    }
    .with_write_timeout(cfg.cache_write_timeout());

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    let event_loop = tokio::spawn(api::events::process_events(event_rx));

    let catalog = api::services::CachedProductCatalog::new(
        Arc::new(ProductRepository::new(db_arc.clone())),
        cache.clone(),
        Duration::from_secs(cfg.cache_default_ttl_secs),
    );

    let mut payments = api::services::PaymentService::new(
        Arc::new(OrderRepository::new(db_arc.clone())),
        Arc::new(catalog),
        Arc::new(DeadLetterRepository::new(db_arc.clone())),
        Arc::new(api::notifications::EventNotifier::new(event_sender)),
        cache.clone(),
    )
    .with_default_currency(cfg.default_currency.clone());

    if let Some(secret_key) = cfg.stripe_secret_key() {
        let client = StripeClient::new(StripeConfig::new(secret_key, &cfg.stripe_api_base))?;
        payments = payments.with_gateway(Arc::new(client));
        info!("Stripe payment gateway enabled");
    }
    if let Some(secret) = cfg.stripe_webhook_secret() {
        payments = payments.with_webhook_verifier(WebhookVerifier::new(
            secret,
            cfg.webhook_tolerance(),
        ));
    }

    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        payments: Arc::new(payments),
        cache,
    };

    let app = api::app_router(app_state);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last event sender, so the loop drains and exits
    if let Err(e) = event_loop.await {
        error!(error = %e, "event loop terminated abnormally");
    }
    if let Ok(pool) = Arc::try_unwrap(db_arc) {
        api::db::close_pool(pool).await?;
    }

    Ok(())
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

    info!("Shutdown signal received");
}
