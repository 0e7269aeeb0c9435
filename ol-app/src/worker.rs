//! The worker pool: N concurrent consumers of the durable queue, enforcing
//! idempotency markers and the retry/dead-letter policy around the
//! pipeline.

use crate::notify::NotificationDispatcher;
use crate::pipeline::Pipeline;
use dashmap::DashMap;
use ol_channels::{IdentityKey, RawMessage};
use ol_store::{MarkerKind, MarkerStore, WorkQueue};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub pop_timeout: Duration,
    pub processing_ttl: Duration,
    pub processed_ttl: Duration,
    pub store_error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            pop_timeout: Duration::from_secs(10),
            processing_ttl: Duration::from_secs(300),
            processed_ttl: Duration::from_secs(86_400),
            store_error_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub duplicates_skipped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub dead_lettered: u64,
    pub duplicates_skipped: u64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Stable processing key for a message: the channel-scoped message id when
/// the channel supplied one, else a digest of identity and arrival time.
pub fn resolve_message_key(
    identity: Option<IdentityKey>,
    message: &RawMessage,
) -> Option<String> {
    if let Some(message_id) = &message.message_id {
        return Some(format!("{}:{}", message.channel, message_id));
    }
    identity.map(|identity| {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_str().as_bytes());
        hasher.update(message.timestamp.to_rfc3339().as_bytes());
        let hex: String = hasher
            .finalize()
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("synth:{hex}")
    })
}

pub struct WorkerPool {
    queue: WorkQueue,
    markers: MarkerStore,
    pipeline: Arc<Pipeline>,
    notifier: Arc<NotificationDispatcher>,
    settings: WorkerSettings,
    retry_counts: DashMap<String, u32>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerPool {
    pub fn new(
        queue: WorkQueue,
        markers: MarkerStore,
        pipeline: Arc<Pipeline>,
        notifier: Arc<NotificationDispatcher>,
        settings: WorkerSettings,
        metrics: Arc<WorkerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            markers,
            pipeline,
            notifier,
            settings,
            retry_counts: DashMap::new(),
            metrics,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (1..=self.settings.workers)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::info!(worker_id, "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.queue.pop(self.settings.pop_timeout) => match popped {
                    Ok(None) => continue,
                    Ok(Some(queued)) => self.handle_message(worker_id, queued.payload).await,
                    Err(e) => {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        tracing::error!(%e, worker_id, "queue pop failed, backing off");
                        tokio::time::sleep(self.settings.store_error_backoff).await;
                    }
                }
            }
        }
        tracing::info!(worker_id, "worker stopped");
    }

    async fn handle_message(&self, worker_id: usize, payload: String) {
        let message: RawMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                // Malformed input is a validation error: dropped, never retried.
                let preview: String = payload.chars().take(200).collect();
                tracing::error!(
                    %e,
                    worker_id,
                    %preview,
                    "malformed queue payload dropped"
                );
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let message_key = resolve_message_key(self.notifier.identity_of(&message), &message)
            .unwrap_or_else(|| format!("anon:{}", uuid::Uuid::new_v4()));

        match self
            .markers
            .exists(MarkerKind::Processed, &message_key)
            .await
        {
            Ok(true) => {
                tracing::info!(worker_id, message_key, "message already processed, skipping");
                self.metrics.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%e, message_key, "processed-marker check failed, continuing");
            }
        }

        match self
            .markers
            .acquire(
                MarkerKind::Processing,
                &message_key,
                self.settings.processing_ttl,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    worker_id,
                    message_key,
                    "message claimed by another worker, skipping"
                );
                self.metrics.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!(%e, message_key, "processing claim failed, continuing unclaimed");
            }
        }

        tracing::info!(worker_id, message_key, channel = %message.channel, "processing message");
        let result = self.pipeline.process(&message).await;

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .markers
                    .set(MarkerKind::Processed, &message_key, self.settings.processed_ttl)
                    .await
                {
                    tracing::warn!(%e, message_key, "failed to set processed marker");
                }
                if let Err(e) = self.markers.clear(MarkerKind::Processing, &message_key).await {
                    tracing::warn!(%e, message_key, "failed to clear processing marker");
                }
                self.retry_counts.remove(&message_key);
                self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(worker_id, message_key, "message processed");
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                if let Err(clear_err) =
                    self.markers.clear(MarkerKind::Processing, &message_key).await
                {
                    tracing::warn!(%clear_err, message_key, "failed to clear processing marker");
                }

                let attempts = {
                    let mut entry = self.retry_counts.entry(message_key.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };

                if attempts >= self.settings.max_retries {
                    tracing::error!(
                        %e,
                        worker_id,
                        message_key,
                        attempts,
                        "retries exhausted, dead-lettering message"
                    );
                    match self
                        .queue
                        .dead_letter(&payload, &format!("{e:#}"), attempts)
                        .await
                    {
                        Ok(()) => {
                            self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(dl_err) => {
                            tracing::error!(%dl_err, message_key, "dead-letter write failed");
                        }
                    }
                    self.retry_counts.remove(&message_key);
                } else {
                    tracing::warn!(
                        %e,
                        worker_id,
                        message_key,
                        attempt = attempts,
                        max_retries = self.settings.max_retries,
                        "processing failed, requeueing message"
                    );
                    if let Err(push_err) = self.queue.push(&payload).await {
                        tracing::error!(%push_err, message_key, "requeue failed, dead-lettering");
                        let _ = self
                            .queue
                            .dead_letter(&payload, &format!("requeue failed: {push_err}"), attempts)
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        FailingCatalog, TestStack, chat_message, stack, stack_with_provider, wait_until,
        widget_catalog,
    };
    use ol_store::OrderStatus;
    use std::sync::atomic::Ordering;

    const FULL_ORDER_RESPONSE: &str = r#"{
        "products": [{"code": "WX-1001", "name": "Widget", "quantity": 2}],
        "customer": {"name": "Jane Doe", "phone": "+15550100199", "address": "Springfield, 123 Main St"},
        "unfound_products": []
    }"#;

    fn test_pool(
        test_stack: &TestStack,
        workers: usize,
        max_retries: u32,
        metrics: Arc<WorkerMetrics>,
    ) -> Arc<WorkerPool> {
        WorkerPool::new(
            test_stack.queue.clone(),
            test_stack.markers.clone(),
            test_stack.pipeline.clone(),
            test_stack.notifier.clone(),
            WorkerSettings {
                workers,
                max_retries,
                pop_timeout: Duration::from_millis(50),
                processing_ttl: Duration::from_secs(300),
                processed_ttl: Duration::from_secs(86_400),
                store_error_backoff: Duration::from_millis(10),
            },
            metrics,
        )
    }

    async fn shut_down(shutdown: CancellationToken, handles: Vec<JoinHandle<()>>) {
        shutdown.cancel();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    #[tokio::test]
    async fn duplicate_enqueues_yield_exactly_one_order() {
        let test_stack = stack(vec![Ok(FULL_ORDER_RESPONSE.to_string())], widget_catalog()).await;
        let message = chat_message("m-1", "42", "2 widgets please");
        let payload = serde_json::to_string(&message).expect("serialize");

        // The same message identity enqueued three times.
        for _ in 0..3 {
            test_stack.queue.push(&payload).await.expect("push");
        }

        let metrics = Arc::new(WorkerMetrics::default());
        let pool = test_pool(&test_stack, 2, 3, metrics.clone());
        let shutdown = CancellationToken::new();
        let handles = pool.start(shutdown.clone());

        let metrics_view = metrics.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                metrics_view.processed.load(Ordering::Relaxed)
                    + metrics_view.duplicates_skipped.load(Ordering::Relaxed)
                    >= 3
            })
            .await,
            "workers did not drain the queue"
        );
        shut_down(shutdown, handles).await;

        assert_eq!(metrics.processed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.duplicates_skipped.load(Ordering::Relaxed), 2);

        let orders = test_stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1, "duplicates must be no-ops");
    }

    #[tokio::test]
    async fn concurrent_workers_claim_a_message_at_most_once() {
        let test_stack = stack(vec![Ok(FULL_ORDER_RESPONSE.to_string())], widget_catalog()).await;
        let message = chat_message("m-7", "42", "2 widgets please");
        let payload = serde_json::to_string(&message).expect("serialize");
        test_stack.queue.push(&payload).await.expect("push");
        test_stack.queue.push(&payload).await.expect("push");

        let metrics = Arc::new(WorkerMetrics::default());
        let pool = test_pool(&test_stack, 4, 3, metrics.clone());
        let shutdown = CancellationToken::new();
        let handles = pool.start(shutdown.clone());

        let metrics_view = metrics.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                metrics_view.processed.load(Ordering::Relaxed)
                    + metrics_view.duplicates_skipped.load(Ordering::Relaxed)
                    >= 2
            })
            .await
        );
        shut_down(shutdown, handles).await;

        assert_eq!(metrics.processed.load(Ordering::Relaxed), 1);
        let orders = test_stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_move_the_message_to_the_dead_letter_queue() {
        // Catalog permanently down and no snapshot: every pipeline run fails.
        let test_stack = stack_with_provider(vec![], Arc::new(FailingCatalog)).await;
        let message = chat_message("m-9", "42", "2 widgets please");
        let payload = serde_json::to_string(&message).expect("serialize");
        test_stack.queue.push(&payload).await.expect("push");

        let metrics = Arc::new(WorkerMetrics::default());
        let pool = test_pool(&test_stack, 1, 2, metrics.clone());
        let shutdown = CancellationToken::new();
        let handles = pool.start(shutdown.clone());

        let metrics_view = metrics.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                metrics_view.dead_lettered.load(Ordering::Relaxed) == 1
            })
            .await,
            "message was not dead-lettered"
        );
        shut_down(shutdown, handles).await;

        assert_eq!(metrics.errors.load(Ordering::Relaxed), 2);
        let entries = test_stack.queue.dead_letters(10).await.expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retries, 2);
        assert_eq!(entries[0].original_message, payload);
        assert_eq!(test_stack.queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_not_retried() {
        let test_stack = stack(vec![], widget_catalog()).await;
        test_stack.queue.push("{not json").await.expect("push");

        let metrics = Arc::new(WorkerMetrics::default());
        let pool = test_pool(&test_stack, 1, 3, metrics.clone());
        let shutdown = CancellationToken::new();
        let handles = pool.start(shutdown.clone());

        let metrics_view = metrics.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                metrics_view.errors.load(Ordering::Relaxed) == 1
            })
            .await
        );
        shut_down(shutdown, handles).await;

        assert_eq!(test_stack.queue.len().await.expect("len"), 0);
        assert!(test_stack.queue.dead_letters(10).await.expect("entries").is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_workers_within_the_grace_period() {
        let test_stack = stack(vec![], widget_catalog()).await;
        let metrics = Arc::new(WorkerMetrics::default());
        let pool = test_pool(&test_stack, 3, 3, metrics);
        let shutdown = CancellationToken::new();
        let handles = pool.start(shutdown.clone());

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("worker did not stop in time")
                .expect("worker task panicked");
        }
    }

    #[test]
    fn message_key_prefers_the_channel_message_id() {
        let message = chat_message("m-42", "7", "hello");
        let key = resolve_message_key(Some(IdentityKey::new("chat:7")), &message)
            .expect("key");
        assert_eq!(key, "chat:m-42");
    }

    #[test]
    fn message_key_is_synthesized_from_identity_and_time() {
        let mut message = chat_message("unused", "7", "hello");
        message.message_id = None;
        let key_a = resolve_message_key(Some(IdentityKey::new("chat:7")), &message).expect("key");
        let key_b = resolve_message_key(Some(IdentityKey::new("chat:7")), &message).expect("key");
        assert_eq!(key_a, key_b, "same identity+timestamp must collide");
        assert!(key_a.starts_with("synth:"));

        message.timestamp = message.timestamp + chrono::Duration::seconds(1);
        let key_c = resolve_message_key(Some(IdentityKey::new("chat:7")), &message).expect("key");
        assert_ne!(key_a, key_c);

        assert!(resolve_message_key(None, &message).is_none());
    }
}
