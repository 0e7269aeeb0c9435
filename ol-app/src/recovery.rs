//! Startup reconciliation: orders that committed `validated` or
//! `invoice_created` but never got their confirmation out (no `notified`
//! marker) are re-driven through invoice allocation and notification,
//! closing the gap between a commit and its external side effect.

use crate::notify::NotificationDispatcher;
use crate::pipeline::confirmation_from_order;
use anyhow::Result;
use ol_channels::Channel;
use ol_store::{MarkerKind, MarkerStore, Order, OrderStatus, OrderStore, TransitionFields};
use std::sync::Arc;
use std::time::Duration;

const RECOVERY_BATCH_LIMIT: u32 = 100;

pub struct Recovery {
    orders: OrderStore,
    markers: MarkerStore,
    notifier: Arc<NotificationDispatcher>,
    notified_ttl: Duration,
}

impl Recovery {
    pub fn new(
        orders: OrderStore,
        markers: MarkerStore,
        notifier: Arc<NotificationDispatcher>,
        notified_ttl: Duration,
    ) -> Self {
        Self {
            orders,
            markers,
            notifier,
            notified_ttl,
        }
    }

    /// Returns how many orders were recovered. Per-order failures are
    /// logged and skipped; the pass itself only fails on a store error.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self) -> Result<u32> {
        let pending = self
            .orders
            .by_status(
                &[OrderStatus::Validated, OrderStatus::InvoiceCreated],
                RECOVERY_BATCH_LIMIT,
            )
            .await?;
        if pending.is_empty() {
            tracing::info!("no pending orders found for recovery");
            return Ok(0);
        }

        let total = pending.len();
        let mut recovered = 0;
        for order in pending {
            match self
                .markers
                .exists(MarkerKind::Notified, &order.id.to_string())
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%e, order_number = %order.order_number, "notified-marker check failed, skipping");
                    continue;
                }
            }

            tracing::info!(
                order_number = %order.order_number,
                status = %order.status,
                "recovery found unnotified order"
            );
            match self.recover_order(order).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(%e, "order recovery failed"),
            }
        }

        tracing::info!(recovered, total, "startup recovery complete");
        Ok(recovered)
    }

    async fn recover_order(&self, order: Order) -> Result<bool> {
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

        let Some((channel, recipient)) = confirmation_target(&order) else {
            tracing::warn!(
                order_number = %order.order_number,
                channel = %order.channel,
                "no reachable recipient for recovery notification"
            );
            return Ok(false);
        };

        self.notifier
            .send_confirmation(channel, &recipient, &confirmation_from_order(&order))
            .await?;
        self.markers
            .set(
                MarkerKind::Notified,
                &order.id.to_string(),
                self.notified_ttl,
            )
            .await?;
        tracing::info!(order_number = %order.order_number, "recovery notification sent");
        Ok(true)
    }
}

fn confirmation_target(order: &Order) -> Option<(Channel, String)> {
    match order.channel.as_str() {
        "chat" => order
            .chat_user_id
            .clone()
            .map(|user_id| (Channel::Chat, user_id)),
        "email" => order
            .customer_email
            .clone()
            .map(|address| (Channel::Email, address)),
        "form" => order
            .customer_email
            .clone()
            .map(|address| (Channel::Form, address)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{stack, widget_catalog};
    use ol_store::{NewOrder, OrderItem};

    fn validated_order() -> NewOrder {
        NewOrder {
            channel: "chat".to_string(),
            customer_name: Some("Jane Doe".to_string()),
            customer_phone: Some("+15550100199".to_string()),
            customer_address: Some("Springfield, 123 Main St".to_string()),
            customer_email: None,
            chat_user_id: Some("42".to_string()),
            items: vec![OrderItem {
                code: "WX-1001".to_string(),
                name: "Widget".to_string(),
                quantity: 2,
                unit_price: 25.0,
            }],
            delivery_cost: 10.0,
        }
    }

    #[tokio::test]
    async fn unnotified_validated_order_is_redriven() {
        let stack = stack(vec![], widget_catalog()).await;

        // An order that committed `validated` but crashed before its
        // confirmation went out.
        let order = stack.orders.create(validated_order()).await.expect("create");
        stack
            .orders
            .transition(order.id, OrderStatus::Validated, TransitionFields::default())
            .await
            .expect("validate");

        let recovery = Recovery::new(
            stack.orders.clone(),
            stack.markers.clone(),
            stack.notifier.clone(),
            Duration::from_secs(7 * 86_400),
        );
        let recovered = recovery.run().await.expect("recovery");
        assert_eq!(recovered, 1);

        let order = stack
            .orders
            .get(order.id)
            .await
            .expect("get")
            .expect("order");
        assert_eq!(order.status, OrderStatus::InvoiceCreated);
        assert!(order.invoice_number.is_some());
        assert_eq!(stack.adapter.confirmation_count(), 1);
        assert!(
            stack
                .markers
                .exists(MarkerKind::Notified, &order.id.to_string())
                .await
                .expect("exists")
        );

        // A second pass finds nothing to do.
        let recovered = recovery.run().await.expect("recovery");
        assert_eq!(recovered, 0);
        assert_eq!(stack.adapter.confirmation_count(), 1);
    }

    #[tokio::test]
    async fn already_notified_orders_are_skipped() {
        let stack = stack(vec![], widget_catalog()).await;

        let order = stack.orders.create(validated_order()).await.expect("create");
        stack
            .orders
            .transition(order.id, OrderStatus::Validated, TransitionFields::default())
            .await
            .expect("validate");
        stack
            .markers
            .set(
                MarkerKind::Notified,
                &order.id.to_string(),
                Duration::from_secs(3600),
            )
            .await
            .expect("set marker");

        let recovery = Recovery::new(
            stack.orders.clone(),
            stack.markers.clone(),
            stack.notifier.clone(),
            Duration::from_secs(7 * 86_400),
        );
        let recovered = recovery.run().await.expect("recovery");
        assert_eq!(recovered, 0);
        assert_eq!(stack.adapter.confirmation_count(), 0);
    }
}
