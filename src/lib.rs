pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::{extract::Request, ServiceExt};

use crate::core::shutdown::{shutdown_signal, ShutdownHandle};
use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::repositories::store::PgPrintStore;
use crate::services::dispatch::{Dispatcher, HttpDispatcher, LocalDispatcher};
use crate::services::storage::{PageStore, StorageService};
use crate::services::vision::OpenAiVision;

async fn build_state(settings: Settings) -> anyhow::Result<(AppState, RedisHandle)> {
    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing without rate limits");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let pages = StorageService::from_settings(&settings)
        .await?
        .map(|storage| Arc::new(storage) as Arc<dyn PageStore>);
    if pages.is_none() {
        tracing::warn!("S3 storage is not configured; uploads will be refused");
    }

    let vision = Arc::new(OpenAiVision::from_settings(&settings)?);

    let dispatcher: Arc<dyn Dispatcher> = match HttpDispatcher::from_settings(&settings)? {
        Some(http) => Arc::new(http),
        None => {
            tracing::info!("No trigger URL configured; processing runs in-process");
            Arc::new(LocalDispatcher)
        }
    };

    let store = Arc::new(PgPrintStore::new(db_pool));
    let state = AppState::new(settings, redis.clone(), store, pages, vision, dispatcher);
    Ok((state, redis))
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let (state, redis) = build_state(settings).await?;

    let shutdown = ShutdownHandle::new();
    let reconciler = state.settings().pipeline().embedded_worker.then(|| {
        tracing::info!("Embedded reconciliation loop enabled");
        tokio::spawn(tasks::scheduler::reconcile_loop(state.clone(), shutdown.subscribe()))
    });

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Print OMR API listening"
    );

    let server_shutdown = shutdown.clone();
    let result = axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.trigger();
        })
        .await;

    shutdown.trigger();
    if let Some(handle) = reconciler {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Reconciliation loop join failed");
        }
    }

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let (state, redis) = build_state(settings).await?;

    let result = tasks::scheduler::run(state).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
