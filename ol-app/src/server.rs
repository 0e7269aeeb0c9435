//! Orderline server: builds the store, adapters, breakers, parser and
//! worker pool, runs the startup recovery pass, and mounts the HTTP
//! contracts.

use crate::breaker::CircuitBreaker;
use crate::catalog::{CatalogCache, HttpCatalogProvider};
use crate::config::OrderlineConfig;
use crate::delivery::DeliveryCalculator;
use crate::export::{Exporter, HttpExportClient};
use crate::fulfillment::Fulfillment;
use crate::notify::{NotificationDispatcher, OperatorChannel};
use crate::parser::OrderParser;
use crate::pipeline::Pipeline;
use crate::recovery::Recovery;
use crate::routes;
use crate::worker::{WorkerMetrics, WorkerPool};
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::Request;
use ol_channels::{Channel, ChannelAdapter, ChatAdapter, EmailAdapter, FormAdapter};
use ol_llm::LlmClient;
use ol_store::{ContextStore, Database, MarkerStore, OrderStore, WorkQueue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct AppState {
    pub queue: WorkQueue,
    pub markers: MarkerStore,
    pub orders: OrderStore,
    pub notifier: Arc<NotificationDispatcher>,
    pub fulfillment: Arc<Fulfillment>,
    pub metrics: Arc<WorkerMetrics>,
    pub breakers: Vec<Arc<CircuitBreaker>>,
    pub sending_ttl: Duration,
    pub workers: usize,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OrderlineConfig::load(config_path).await?;
    ensure_store_dir(&cfg).await?;
    let db = Database::open(&cfg.store.path).await?;
    let depth = WorkQueue::new(db).len().await?;
    tracing::info!(
        model = %cfg.llm.model,
        catalog_url = %cfg.catalog.url,
        export_url = %cfg.export.url,
        store_path = %cfg.store.path.display(),
        workers = cfg.queue.workers,
        queue_depth = depth,
        chat_enabled = cfg.channels.chat.enabled,
        email_enabled = cfg.channels.email.enabled,
        form_enabled = cfg.channels.form.enabled,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OrderlineConfig::load(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        bind_addr = %cfg.server.bind_addr,
        model = %cfg.llm.model,
        workers = cfg.queue.workers,
        max_retries = cfg.queue.max_retries,
        catalog_url = %cfg.catalog.url,
        export_url = %cfg.export.url,
        chat_enabled = cfg.channels.chat.enabled,
        email_enabled = cfg.channels.email.enabled,
        form_enabled = cfg.channels.form.enabled,
        operator_configured = cfg.operator.is_some(),
        "server configuration loaded"
    );

    ensure_store_dir(&cfg).await?;
    let db = Database::open(&cfg.store.path).await?;
    let queue = WorkQueue::new(db.clone());
    let markers = MarkerStore::new(db.clone());
    let contexts = ContextStore::new(db.clone());
    let orders = OrderStore::new(db);

    let adapters = build_adapters(&cfg)?;
    tracing::info!(
        channels = ?adapters.keys().collect::<Vec<_>>(),
        "channel adapters loaded"
    );

    let retry = cfg.retry_policy();
    let llm_breaker = Arc::new(CircuitBreaker::new(
        "llm",
        cfg.breakers.llm_failure_threshold,
        Duration::from_secs(cfg.breakers.llm_recovery_seconds),
    ));
    let export_breaker = Arc::new(CircuitBreaker::new(
        "export",
        cfg.breakers.export_failure_threshold,
        Duration::from_secs(cfg.breakers.export_recovery_seconds),
    ));
    let messaging_breaker = Arc::new(CircuitBreaker::new(
        "messaging",
        cfg.breakers.messaging_failure_threshold,
        Duration::from_secs(cfg.breakers.messaging_recovery_seconds),
    ));

    let operator = cfg.operator.as_ref().and_then(|operator| {
        let channel = match operator.channel.as_str() {
            "chat" => Channel::Chat,
            "email" => Channel::Email,
            "form" => Channel::Form,
            _ => return None,
        };
        Some(OperatorChannel {
            channel,
            recipient: operator.recipient.clone(),
        })
    });
    let notifier = Arc::new(NotificationDispatcher::new(
        adapters,
        messaging_breaker.clone(),
        retry.clone(),
        operator,
    ));

    let api_key = cfg.llm.api_key.clone().unwrap_or_default();
    let model = LlmClient::new(&api_key, &cfg.llm.model, cfg.llm.base_url.as_deref())
        .map_err(|e| anyhow::anyhow!("llm client init failed: {e}"))?;
    let parser = OrderParser::new(Arc::new(model), llm_breaker.clone(), retry.clone());

    let catalog_provider = Arc::new(HttpCatalogProvider::new(
        &cfg.catalog.url,
        cfg.catalog.auth_token.clone(),
    )?);
    let catalog = Arc::new(CatalogCache::new(
        catalog_provider,
        Duration::from_secs(cfg.catalog.cache_ttl_seconds),
    ));
    let delivery = DeliveryCalculator::new(cfg.delivery.clone().unwrap_or_default());

    let pipeline = Arc::new(Pipeline::new(
        orders.clone(),
        contexts,
        markers.clone(),
        parser,
        catalog,
        delivery,
        notifier.clone(),
        cfg.pipeline_settings(),
    ));

    let export_service = Arc::new(HttpExportClient::new(
        &cfg.export.url,
        cfg.export.api_key.clone(),
    )?);
    let exporter = Exporter::new(export_service, export_breaker.clone(), retry.clone());
    let fulfillment = Arc::new(Fulfillment::new(orders.clone(), exporter, notifier.clone()));

    let recovery = Recovery::new(
        orders.clone(),
        markers.clone(),
        notifier.clone(),
        cfg.pipeline_settings().notified_ttl,
    );
    match recovery.run().await {
        Ok(recovered) => tracing::info!(recovered, "startup recovery finished"),
        Err(e) => tracing::warn!(%e, "startup recovery failed (non-fatal)"),
    }

    let metrics = Arc::new(WorkerMetrics::default());
    let pool = WorkerPool::new(
        queue.clone(),
        markers.clone(),
        pipeline,
        notifier.clone(),
        cfg.worker_settings(),
        metrics.clone(),
    );
    let shutdown = CancellationToken::new();
    let worker_handles = pool.start(shutdown.child_token());
    tracing::info!(workers = worker_handles.len(), "worker pool started");

    let state = Arc::new(AppState {
        queue,
        markers,
        orders,
        notifier,
        fulfillment,
        metrics,
        breakers: vec![llm_breaker, export_breaker, messaging_breaker],
        sending_ttl: Duration::from_secs(cfg.queue.sending_ttl_seconds),
        workers: cfg.queue.workers,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        tracing::info_span!(
            "http.request",
            method = %request.method(),
            uri = %request.uri(),
        )
    });
    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::new(Duration::from_secs(
            cfg.server.http_timeout_seconds,
        )))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("bind failed for {}", cfg.server.bind_addr))?;
    tracing::info!(bind_addr = %cfg.server.bind_addr, "orderline serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    // Let in-flight iterations finish within the grace period, then cancel.
    shutdown.cancel();
    let abort_handles: Vec<_> = worker_handles
        .iter()
        .map(|handle| handle.abort_handle())
        .collect();
    let drain = futures_util::future::join_all(worker_handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("workers did not drain within the grace period, cancelling");
        for handle in abort_handles {
            handle.abort();
        }
    }
    tracing::info!("worker pool stopped");

    Ok(())
}

async fn ensure_store_dir(cfg: &OrderlineConfig) -> Result<()> {
    if let Some(parent) = cfg.store.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create store dir {}", parent.display()))?;
    }
    Ok(())
}

fn build_adapters(cfg: &OrderlineConfig) -> Result<HashMap<Channel, Arc<dyn ChannelAdapter>>> {
    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.chat.enabled {
        adapters.insert(
            Channel::Chat,
            Arc::new(
                ChatAdapter::new(
                    &cfg.channels.chat.send_url,
                    cfg.channels.chat.auth_token.clone(),
                )
                .map_err(|e| anyhow::anyhow!("chat adapter init failed: {e}"))?,
            ),
        );
    }
    if cfg.channels.email.enabled {
        adapters.insert(
            Channel::Email,
            Arc::new(
                EmailAdapter::new(
                    &cfg.channels.email.send_url,
                    &cfg.channels.email.from_address,
                    cfg.channels.email.auth_token.clone(),
                )
                .map_err(|e| anyhow::anyhow!("email adapter init failed: {e}"))?,
            ),
        );
    }
    if cfg.channels.form.enabled {
        adapters.insert(
            Channel::Form,
            Arc::new(
                FormAdapter::new(
                    &cfg.channels.form.send_url,
                    &cfg.channels.form.from_address,
                    cfg.channels.form.auth_token.clone(),
                )
                .map_err(|e| anyhow::anyhow!("form adapter init failed: {e}"))?,
            ),
        );
    }
    Ok(adapters)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(%e, "failed to install SIGTERM handler; falling back to ctrl-c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(%ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(%e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
