//! Statecraft demo shop
//!
//! Wires a store end-to-end: cached async price lookups, a persisted
//! snapshot, and a checkout saga that survives restarts.

mod config;
mod shop;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use statecraft::{
    AsyncFlowMiddleware, CacheMiddleware, IsolationMiddleware, LifecycleListener,
    PersistenceStrategy, SagaEngine, SagaMiddleware, SagaPersistencePolicy, Store,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::shop::{AddToCart, ChargeCard, FetchPrice, PlaceOrder, Shop};
use crate::storage::{JsonDirSagaStorage, JsonFileStorage};

/// Logs lifecycle transitions.
struct Announce;

impl LifecycleListener for Announce {
    fn on_store_created(&self) -> Result<()> {
        tracing::info!("shop store created");
        Ok(())
    }

    fn on_restoration_completed(&self, restored: bool) -> Result<()> {
        if restored {
            tracing::info!("picked up where we left off");
        } else {
            tracing::info!("starting with an empty shop");
        }
        Ok(())
    }

    fn on_store_destroyed(&self) -> Result<()> {
        tracing::info!("shop store destroyed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,statecraft=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        persistence = %config.persistence,
        cache_ttl = ?config.cache_ttl,
        saga_debounce = ?config.saga_debounce,
        data_dir = %config.data_dir.display(),
        "Starting statecraft demo"
    );

    // Sagas
    let saga_storage = Arc::new(JsonDirSagaStorage::<shop::Checkout>::new(
        config.data_dir.join("sagas"),
    ));
    let engine = SagaEngine::builder()
        .register(shop::checkout_saga().with_storage(
            saga_storage,
            SagaPersistencePolicy::Debounced(config.saga_debounce),
        ))
        .build()?;
    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "checkouts were in flight at last shutdown");
    }

    // Store
    let storage = Arc::new(JsonFileStorage::<Shop>::new(config.data_dir.join("shop.json")));
    let store = Store::builder(Shop::default())
        .reducer(shop::reduce)
        .with_middleware(IsolationMiddleware::new())
        .with_middleware(
            CacheMiddleware::new()
                .with_default_ttl(config.cache_ttl)
                .cacheable::<FetchPrice>(),
        )
        .with_middleware(
            AsyncFlowMiddleware::new()
                .register::<FetchPrice>()
                .register::<ChargeCard>(),
        )
        .with_middleware(SagaMiddleware::new(engine.clone()))
        .with_persistence(storage, PersistenceStrategy::from(config.persistence))
        .with_lifecycle_listener(Announce)
        .build()
        .await;

    // Prices: the second round is answered from the cache.
    for round in 1..=2 {
        for sku in ["coffee", "bagel", "caviar"] {
            let started = tokio::time::Instant::now();
            store
                .dispatch_and_wait(FetchPrice { sku: sku.to_string() })
                .await?;
            tracing::info!(round, sku, elapsed = ?started.elapsed(), "price lookup");
        }
    }

    store.dispatch_and_wait(AddToCart { sku: "coffee".into() }).await?;
    store.dispatch_and_wait(AddToCart { sku: "bagel".into() }).await?;

    let snapshot = store.state();
    let order = snapshot.last_order + 1;
    let total = snapshot.cart_total();
    tracing::info!(order, total, cart = ?snapshot.cart, "placing order");
    store.dispatch_and_wait(PlaceOrder { order, total }).await?;

    let mut rx = store.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|shop| shop.confirmed.contains(&order)),
    )
    .await
    .context("checkout did not finish in time")??;

    let shop = store.state();
    tracing::info!(
        confirmed = ?shop.confirmed,
        prices = ?shop.prices,
        last_error = ?shop.last_error,
        "checkout complete"
    );

    // Give a debounced save the chance to land before teardown drops it.
    if let statecraft::StrategySpec::Debounced(delay) = config.persistence {
        tokio::time::sleep(delay + Duration::from_millis(50)).await;
    }
    store.destroy().await;

    Ok(())
}
