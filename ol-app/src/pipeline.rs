//! The per-message processing pipeline: context pickup, parsing, order
//! creation/update through the state machine, and notification fan-out.

use crate::catalog::CatalogCache;
use crate::delivery::DeliveryCalculator;
use crate::notify::NotificationDispatcher;
use crate::parser::{OrderParser, ParseInput, ParseOutcome, ParseStatus, ReplyContext};
use anyhow::Result;
use ol_channels::{
    Channel, ClarificationRequest, MessageProduct, OrderConfirmation, OrderLine, RawMessage,
};
use ol_store::{
    ClarificationContext, ContextProduct, ContextStore, MarkerKind, MarkerStore, NewOrder, Order,
    OrderItem, OrderStatus, OrderStore, TransitionFields,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chat_context_ttl: Duration,
    pub email_context_ttl: Duration,
    pub form_context_ttl: Duration,
    pub notified_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chat_context_ttl: Duration::from_secs(3600),
            email_context_ttl: Duration::from_secs(86_400),
            form_context_ttl: Duration::from_secs(86_400),
            notified_ttl: Duration::from_secs(7 * 86_400),
        }
    }
}

pub struct Pipeline {
    orders: OrderStore,
    contexts: ContextStore,
    markers: MarkerStore,
    parser: OrderParser,
    catalog: Arc<CatalogCache>,
    delivery: DeliveryCalculator,
    notifier: Arc<NotificationDispatcher>,
    settings: PipelineSettings,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: OrderStore,
        contexts: ContextStore,
        markers: MarkerStore,
        parser: OrderParser,
        catalog: Arc<CatalogCache>,
        delivery: DeliveryCalculator,
        notifier: Arc<NotificationDispatcher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            orders,
            contexts,
            markers,
            parser,
            catalog,
            delivery,
            notifier,
            settings,
        }
    }

    /// Process one queued message end to end. An `Err` means the message is
    /// retryable; a handled message (including one answered with a
    /// clarification request) is `Ok`.
    #[tracing::instrument(level = "info", skip_all, fields(channel = %message.channel))]
    pub async fn process(&self, message: &RawMessage) -> Result<()> {
        let identity = self.notifier.identity_of(message);

        let mut existing_order_id = message.existing_order_id;
        let mut context_products: Vec<ContextProduct> = message
            .context_products
            .clone()
            .map(|products| products.into_iter().map(wire_to_context).collect())
            .unwrap_or_default();
        let mut known_name = message.customer_name.clone();
        let mut known_phone = message.phone.clone();
        let mut known_address = message.known_address.clone();
        let mut is_reply = existing_order_id.is_some();

        // Messages from an identity with a live clarification context are a
        // dialog reply, not a new order. The context is consumed atomically
        // so a second worker can never interpret the same dialog.
        if !is_reply {
            if let Some(identity) = &identity {
                if let Some(context) = self.contexts.take(identity.as_str()).await? {
                    tracing::info!(
                        identity = %identity,
                        order_number = ?context.order_number,
                        context_products = context.products.len(),
                        "clarification context picked up"
                    );
                    existing_order_id = context.order_id;
                    context_products = context.products;
                    known_name = known_name.or(context.known_name);
                    known_phone = known_phone.or(context.known_phone);
                    known_address = known_address.or(context.known_address);
                    is_reply = true;
                }
            }
        }

        let catalog = self.catalog.items().await?;
        let content = message.content();
        let outcome = self
            .parser
            .parse(&ParseInput {
                content: &content,
                catalog: &catalog,
                known_name: known_name.as_deref(),
                known_phone: known_phone.as_deref(),
                known_address: known_address.as_deref(),
                reply: is_reply.then_some(ReplyContext {
                    products: &context_products,
                }),
            })
            .await?;

        let recipient = message.reply_recipient().map(str::to_string);

        if outcome.products.is_empty() {
            // No order can exist without a product, but the customer still
            // gets an answer; a failed parse is never silent.
            tracing::warn!(
                unfound = outcome.unfound_products.len(),
                "no catalog products resolved from message"
            );
            if let Some(recipient) = recipient {
                let mut questions = vec![
                    "We could not find any catalog products in your message. Please share product codes or names."
                        .to_string(),
                ];
                questions.extend(outcome.clarification_questions.iter().cloned());
                let request = ClarificationRequest {
                    order_number: None,
                    questions,
                    unfound_products: outcome.unfound_products.clone(),
                    parsed_products: vec![],
                };
                self.spawn_clarification(message.channel, recipient, request);
            }
            return Ok(());
        }

        let items: Vec<OrderItem> = outcome
            .products
            .iter()
            .map(|product| OrderItem {
                code: product.code.clone(),
                name: product.name.clone(),
                quantity: product.quantity,
                unit_price: product.unit_price,
            })
            .collect();
        let address = outcome.customer.address.clone();

        let order = match existing_order_id {
            Some(order_id) => {
                let delivery_cost = address
                    .as_deref()
                    .map(|addr| self.delivery.quote_for_address(Some(addr), &items).cost);
                self.orders
                    .update_customer_data(
                        order_id,
                        outcome.customer.name.clone(),
                        outcome.customer.phone.clone(),
                        address.clone(),
                        Some(items.clone()),
                        delivery_cost,
                    )
                    .await?
            }
            None => {
                let delivery_cost = address
                    .as_deref()
                    .map(|addr| self.delivery.quote_for_address(Some(addr), &items).cost)
                    .unwrap_or(0.0);
                self.orders
                    .create(NewOrder {
                        channel: message.channel.as_str().to_string(),
                        customer_name: outcome.customer.name.clone(),
                        customer_phone: outcome.customer.phone.clone(),
                        customer_address: address.clone(),
                        customer_email: message.email.clone(),
                        chat_user_id: message.chat_user_id.clone(),
                        items: items.clone(),
                        delivery_cost,
                    })
                    .await?
            }
        };

        match outcome.status {
            ParseStatus::NeedsClarification => {
                self.store_context_and_ask(message, &identity, &order, &outcome)
                    .await
            }
            ParseStatus::Validated => self.finalize_validated(message, order, recipient).await,
        }
    }

    async fn store_context_and_ask(
        &self,
        message: &RawMessage,
        identity: &Option<ol_channels::IdentityKey>,
        order: &Order,
        outcome: &ParseOutcome,
    ) -> Result<()> {
        if let Some(identity) = identity {
            let context = ClarificationContext {
                order_id: Some(order.id),
                order_number: Some(order.order_number.clone()),
                products: order
                    .items
                    .iter()
                    .map(|item| ContextProduct {
                        code: item.code.clone(),
                        name: item.name.clone(),
                        quantity: item.quantity,
                    })
                    .collect(),
                missing_data: outcome.missing_data.clone(),
                known_name: outcome.customer.name.clone(),
                known_phone: outcome.customer.phone.clone(),
                known_address: outcome.customer.address.clone(),
            };
            self.contexts
                .put(
                    identity.as_str(),
                    &context,
                    self.context_ttl(message.channel),
                )
                .await?;
            tracing::info!(
                identity = %identity,
                order_number = %order.order_number,
                "clarification context stored"
            );
        } else {
            tracing::warn!(
                order_number = %order.order_number,
                "no identity for message, clarification dialog cannot continue"
            );
        }

        if let Some(recipient) = message.reply_recipient() {
            let request = ClarificationRequest {
                order_number: Some(order.order_number.clone()),
                questions: outcome.clarification_questions.clone(),
                unfound_products: outcome.unfound_products.clone(),
                parsed_products: order
                    .items
                    .iter()
                    .map(|item| MessageProduct {
                        code: item.code.clone(),
                        name: item.name.clone(),
                        quantity: item.quantity,
                    })
                    .collect(),
            };
            self.spawn_clarification(message.channel, recipient.to_string(), request);
        }
        Ok(())
    }

    async fn finalize_validated(
        &self,
        message: &RawMessage,
        order: Order,
        recipient: Option<String>,
    ) -> Result<()> {
        let order = if order.status == OrderStatus::New {
            self.orders
                .transition(order.id, OrderStatus::Validated, TransitionFields::default())
                .await?
        } else {
            order
        };

        let order = if order.status == OrderStatus::Validated {
            let invoice_number = self.orders.allocate_invoice_number().await?;
            self.orders
                .transition(
                    order.id,
                    OrderStatus::InvoiceCreated,
                    TransitionFields {
                        invoice_number: Some(invoice_number),
                        ..TransitionFields::default()
                    },
                )
                .await?
        } else {
            order
        };

        if let Some(recipient) = recipient {
            let confirmation = confirmation_from_order(&order);
            let notifier = self.notifier.clone();
            let markers = self.markers.clone();
            let notified_ttl = self.settings.notified_ttl;
            let channel = message.channel;
            let order_id = order.id;
            let order_number = order.order_number.clone();
            spawn_supervised("confirmation", async move {
                notifier
                    .send_confirmation(channel, &recipient, &confirmation)
                    .await?;
                if let Err(e) = markers
                    .set(MarkerKind::Notified, &order_id.to_string(), notified_ttl)
                    .await
                {
                    tracing::warn!(%e, %order_number, "failed to set notified marker");
                }
                Ok(())
            });
        }
        Ok(())
    }

    fn spawn_clarification(&self, channel: Channel, recipient: String, request: ClarificationRequest) {
        let notifier = self.notifier.clone();
        spawn_supervised("clarification", async move {
            notifier
                .send_clarification(channel, &recipient, &request)
                .await
        });
    }

    fn context_ttl(&self, channel: Channel) -> Duration {
        match channel {
            Channel::Chat => self.settings.chat_context_ttl,
            Channel::Email => self.settings.email_context_ttl,
            Channel::Form => self.settings.form_context_ttl,
        }
    }
}

/// Confirmation payload built from the persisted order, so the customer
/// sees exactly what the store (and the invoice) carry.
pub(crate) fn confirmation_from_order(order: &Order) -> OrderConfirmation {
    OrderConfirmation {
        order_number: order.order_number.clone(),
        lines: order
            .items
            .iter()
            .map(|item| OrderLine {
                code: item.code.clone(),
                name: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect(),
        delivery_cost: order.delivery_cost,
        total_amount: order.total_amount,
        invoice_number: order.invoice_number.clone(),
    }
}

fn wire_to_context(product: MessageProduct) -> ContextProduct {
    ContextProduct {
        code: product.code,
        name: product.name,
        quantity: product.quantity,
    }
}

/// Background notification tasks are spawned but never fire-and-forget:
/// failures are captured and logged.
fn spawn_supervised(label: &'static str, task: impl Future<Output = Result<()>> + Send + 'static) {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(%e, task = label, "background notification task failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{chat_message, stack, wait_until, widget_catalog};
    use ol_store::OrderStatus;

    const FULL_ORDER_RESPONSE: &str = r#"{
        "products": [{"code": "WX-1001", "name": "Widget", "quantity": 2}],
        "customer": {"name": "Jane Doe", "phone": "+15550100199", "address": "Springfield, 123 Main St"},
        "unfound_products": []
    }"#;

    const MISSING_PHONE_RESPONSE: &str = r#"{
        "products": [{"code": "WX-1001", "name": "Widget", "quantity": 2}],
        "customer": {"name": "Jane Doe", "phone": null, "address": "Springfield, 123 Main St"},
        "unfound_products": []
    }"#;

    const PHONE_ONLY_REPLY_RESPONSE: &str = r#"{
        "products": [],
        "customer": {"phone": "+15550100199"},
        "unfound_products": []
    }"#;

    const NO_PRODUCTS_RESPONSE: &str = r#"{
        "products": [],
        "customer": {},
        "unfound_products": ["Vortex Manifold"]
    }"#;

    #[tokio::test]
    async fn validated_message_yields_one_invoiced_order() {
        let stack = stack(
            vec![Ok(FULL_ORDER_RESPONSE.to_string())],
            widget_catalog(),
        )
        .await;

        let message = chat_message(
            "m-1",
            "42",
            "2 units of product X; Jane Doe +1 555 010 0199; Springfield, 123 Main St",
        );
        stack.pipeline.process(&message).await.expect("process");

        let orders = stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.status, OrderStatus::InvoiceCreated);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].quantity, 2);
        assert!((order.items[0].unit_price - 25.0).abs() < f64::EPSILON);
        // items total (50) + default-zone delivery for 2 kg (10)
        assert!((order.total_amount - 60.0).abs() < f64::EPSILON);
        assert!(order.invoice_number.is_some());
        assert_eq!(order.customer_phone.as_deref(), Some("+15550100199"));

        let adapter = stack.adapter.clone();
        assert!(
            wait_until(Duration::from_secs(2), move || {
                adapter.confirmation_count() == 1
            })
            .await,
            "confirmation was not dispatched"
        );
        // A validated order leaves no clarification context behind.
        assert!(
            stack
                .contexts
                .take("chat:42")
                .await
                .expect("take")
                .is_none()
        );
    }

    #[tokio::test]
    async fn clarification_round_trip_updates_the_same_order() {
        let stack = stack(
            vec![
                Ok(MISSING_PHONE_RESPONSE.to_string()),
                Ok(PHONE_ONLY_REPLY_RESPONSE.to_string()),
            ],
            widget_catalog(),
        )
        .await;

        // Round 1: phone missing, order created anyway, context written.
        let first = chat_message("m-1", "42", "2 widgets to Springfield, 123 Main St");
        stack.pipeline.process(&first).await.expect("process first");

        let orders = stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1);
        let created = orders[0].clone();
        assert_eq!(created.status, OrderStatus::New);
        assert!(created.customer_phone.is_none());

        let adapter = stack.adapter.clone();
        assert!(
            wait_until(Duration::from_secs(2), move || {
                adapter.clarification_count() == 1
            })
            .await,
            "clarification was not dispatched"
        );
        {
            let clarifications = stack.adapter.clarifications.lock().expect("lock");
            let (_, request) = &clarifications[0];
            assert_eq!(request.order_number.as_deref(), Some(created.order_number.as_str()));
            assert!(request.questions.iter().any(|q| q.contains("phone")));
        }

        // Round 2: reply supplies the phone; context is consumed and the
        // SAME order advances.
        let second = chat_message("m-2", "42", "my phone is +1 555 010 0199");
        stack
            .pipeline
            .process(&second)
            .await
            .expect("process second");

        let orders = stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1, "reply must not create a second order");
        let updated = &orders[0];
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.order_number, created.order_number);
        assert_eq!(updated.status, OrderStatus::InvoiceCreated);
        assert_eq!(updated.customer_phone.as_deref(), Some("+15550100199"));
        assert_eq!(updated.items[0].quantity, 2);

        assert!(
            stack
                .contexts
                .take("chat:42")
                .await
                .expect("take")
                .is_none(),
            "context must be consumed by the reply"
        );
        let adapter = stack.adapter.clone();
        assert!(
            wait_until(Duration::from_secs(2), move || {
                adapter.confirmation_count() == 1
            })
            .await,
            "confirmation was not dispatched after the reply"
        );
    }

    #[tokio::test]
    async fn message_without_products_gets_a_clarification_not_an_order() {
        let stack = stack(vec![Ok(NO_PRODUCTS_RESPONSE.to_string())], widget_catalog()).await;

        let message = chat_message("m-1", "42", "do you sell vortex manifolds?");
        stack.pipeline.process(&message).await.expect("process");

        let orders = stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert!(orders.is_empty());

        let adapter = stack.adapter.clone();
        assert!(
            wait_until(Duration::from_secs(2), move || {
                adapter.clarification_count() == 1
            })
            .await,
            "clarification was not dispatched"
        );
        let clarifications = stack.adapter.clarifications.lock().expect("lock");
        let (_, request) = &clarifications[0];
        assert!(request.questions[0].contains("could not find any catalog products"));
        assert_eq!(request.unfound_products, vec!["Vortex Manifold".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_quantity_keeps_the_order_in_clarification() {
        let response = r#"{
            "products": [{"code": "WX-1001", "name": "Widget", "quantity": 9}],
            "customer": {"name": "Jane Doe", "phone": "+15550100199", "address": "Springfield, 123 Main St"},
            "unfound_products": []
        }"#;
        let stack = stack(vec![Ok(response.to_string())], widget_catalog()).await;

        let message = chat_message("m-1", "42", "9 widgets please");
        stack.pipeline.process(&message).await.expect("process");

        let orders = stack
            .orders
            .by_status(&OrderStatus::ALL, 10)
            .await
            .expect("orders");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::New);

        let adapter = stack.adapter.clone();
        assert!(
            wait_until(Duration::from_secs(2), move || {
                adapter.clarification_count() == 1
            })
            .await
        );
        let clarifications = stack.adapter.clarifications.lock().expect("lock");
        assert!(
            clarifications[0]
                .1
                .questions
                .iter()
                .any(|q| q.contains("Only 5") && q.contains("asked for 9"))
        );
    }
}
