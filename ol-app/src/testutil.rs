//! Shared test fixtures: scripted extraction model, static catalog,
//! recording channel adapter, and a fully wired pipeline over a temp store.

use crate::breaker::{CircuitBreaker, RetryPolicy};
use crate::catalog::{CatalogCache, CatalogItem, CatalogProvider};
use crate::delivery::{DeliveryCalculator, DeliveryRules};
use crate::notify::NotificationDispatcher;
use crate::parser::OrderParser;
use crate::pipeline::{Pipeline, PipelineSettings};
use async_trait::async_trait;
use chrono::Utc;
use ol_channels::{
    Channel, ChannelAdapter, ClarificationRequest, DispatchResult, IdentityKey, MessageId,
    OrderConfirmation, RawMessage,
};
use ol_llm::ExtractionModel;
use ol_store::{ContextStore, Database, MarkerStore, OrderStore, WorkQueue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct ScriptedModel {
    responses: Mutex<VecDeque<ol_llm::Result<String>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ol_llm::Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl ExtractionModel for ScriptedModel {
    async fn extract(&self, _system: &str, _prompt: &str) -> ol_llm::Result<String> {
        self.responses
            .lock()
            .expect("scripted model lock")
            .pop_front()
            .unwrap_or_else(|| Err(ol_llm::LlmError::Network("script exhausted".to_string())))
    }
}

pub(crate) struct RecordingAdapter {
    channel: Channel,
    pub clarifications: Mutex<Vec<(String, ClarificationRequest)>>,
    pub confirmations: Mutex<Vec<(String, OrderConfirmation)>>,
    pub texts: Mutex<Vec<(String, String)>>,
}

impl RecordingAdapter {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            clarifications: Mutex::new(Vec::new()),
            confirmations: Mutex::new(Vec::new()),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn clarification_count(&self) -> usize {
        self.clarifications.lock().expect("lock").len()
    }

    pub fn confirmation_count(&self) -> usize {
        self.confirmations.lock().expect("lock").len()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey> {
        match self.channel {
            Channel::Chat => message
                .chat_user_id
                .as_deref()
                .map(|id| IdentityKey::new(format!("chat:{id}"))),
            Channel::Email => message
                .email
                .as_deref()
                .map(|addr| IdentityKey::new(format!("email:{addr}"))),
            Channel::Form => message
                .email
                .as_deref()
                .map(|addr| IdentityKey::new(format!("form:{addr}"))),
        }
    }

    async fn send_text(&self, recipient: &str, text: &str) -> DispatchResult<()> {
        self.texts
            .lock()
            .expect("lock")
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_clarification(
        &self,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> DispatchResult<()> {
        self.clarifications
            .lock()
            .expect("lock")
            .push((recipient.to_string(), request.clone()));
        Ok(())
    }

    async fn send_confirmation(
        &self,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> DispatchResult<()> {
        self.confirmations
            .lock()
            .expect("lock")
            .push((recipient.to_string(), confirmation.clone()));
        Ok(())
    }
}

pub(crate) struct StaticCatalog(pub Vec<CatalogItem>);

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn fetch(&self) -> anyhow::Result<Vec<CatalogItem>> {
        Ok(self.0.clone())
    }
}

pub(crate) struct FailingCatalog;

#[async_trait]
impl CatalogProvider for FailingCatalog {
    async fn fetch(&self) -> anyhow::Result<Vec<CatalogItem>> {
        anyhow::bail!("catalog provider down")
    }
}

pub(crate) fn widget_catalog() -> Vec<CatalogItem> {
    vec![
        CatalogItem {
            code: "WX-1001".to_string(),
            name: "Widget".to_string(),
            price: 25.0,
            stock: 5,
        },
        CatalogItem {
            code: "GP-2040".to_string(),
            name: "Gasket Pro".to_string(),
            price: 12.5,
            stock: 3,
        },
    ]
}

pub(crate) fn chat_message(message_id: &str, chat_user_id: &str, text: &str) -> RawMessage {
    RawMessage {
        channel: Channel::Chat,
        message_id: Some(MessageId::new(message_id)),
        timestamp: Utc::now(),
        text: Some(text.to_string()),
        subject: None,
        body: None,
        form_data: None,
        attachments: vec![],
        chat_user_id: Some(chat_user_id.to_string()),
        email: None,
        customer_name: None,
        phone: None,
        known_address: None,
        existing_order_id: None,
        context_products: None,
    }
}

pub(crate) struct TestStack {
    pub queue: WorkQueue,
    pub markers: MarkerStore,
    pub contexts: ContextStore,
    pub orders: OrderStore,
    pub pipeline: Arc<Pipeline>,
    pub adapter: Arc<RecordingAdapter>,
    pub notifier: Arc<NotificationDispatcher>,
    _dir: tempfile::TempDir,
}

pub(crate) async fn stack(
    responses: Vec<ol_llm::Result<String>>,
    catalog_items: Vec<CatalogItem>,
) -> TestStack {
    stack_with_provider(responses, Arc::new(StaticCatalog(catalog_items))).await
}

pub(crate) async fn stack_with_provider(
    responses: Vec<ol_llm::Result<String>>,
    provider: Arc<dyn CatalogProvider>,
) -> TestStack {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("orderline.db"))
        .await
        .expect("open database");
    let queue = WorkQueue::new(db.clone());
    let markers = MarkerStore::new(db.clone());
    let contexts = ContextStore::new(db.clone());
    let orders = OrderStore::new(db);

    let adapter = Arc::new(RecordingAdapter::new(Channel::Chat));
    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    adapters.insert(Channel::Chat, adapter.clone());

    let retry = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    };
    let notifier = Arc::new(NotificationDispatcher::new(
        adapters,
        Arc::new(CircuitBreaker::new("messaging", 5, Duration::from_secs(60))),
        retry.clone(),
        None,
    ));
    let parser = OrderParser::new(
        Arc::new(ScriptedModel::new(responses)),
        Arc::new(CircuitBreaker::new("llm", 3, Duration::from_secs(30))),
        retry,
    );
    let catalog = Arc::new(CatalogCache::new(provider, Duration::from_secs(300)));
    let pipeline = Arc::new(Pipeline::new(
        orders.clone(),
        contexts.clone(),
        markers.clone(),
        parser,
        catalog,
        DeliveryCalculator::new(DeliveryRules::default()),
        notifier.clone(),
        PipelineSettings::default(),
    ));

    TestStack {
        queue,
        markers,
        contexts,
        orders,
        pipeline,
        adapter,
        notifier,
        _dir: dir,
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub(crate) async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
