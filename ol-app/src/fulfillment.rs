//! Post-payment driver: once an order is paid, submit it to the export
//! service and issue tracking. Failures on this path alert the operator
//! channel, never the customer, since payment success was already
//! communicated.

use crate::export::Exporter;
use crate::notify::NotificationDispatcher;
use anyhow::{Context, Result};
use chrono::Utc;
use ol_store::{OrderStatus, OrderStore, TransitionFields};
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

pub fn generate_tracking_number() -> String {
    let date = Utc::now().format("%Y%m%d");
    let digits: String = (0..6)
        .map(|_| char::from(b'0' + rand::thread_rng().gen_range(0..10)))
        .collect();
    format!("TRACK-{date}-{digits}")
}

pub struct Fulfillment {
    orders: OrderStore,
    exporter: Exporter,
    notifier: Arc<NotificationDispatcher>,
}

impl Fulfillment {
    pub fn new(orders: OrderStore, exporter: Exporter, notifier: Arc<NotificationDispatcher>) -> Self {
        Self {
            orders,
            exporter,
            notifier,
        }
    }

    /// Drive a freshly paid order through export and tracking issuance.
    /// Every state change goes through the shared transition function.
    #[tracing::instrument(level = "info", skip_all, fields(order_id = %order_id))]
    pub async fn drive_post_payment(&self, order_id: Uuid) -> Result<()> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .with_context(|| format!("order {order_id} not found"))?;
        if order.status != OrderStatus::Paid {
            tracing::debug!(status = %order.status, "skipping post-payment drive, order is not paid");
            return Ok(());
        }

        match self.exporter.export_order(&order).await {
            Ok(_ack) => {
                self.orders
                    .transition(
                        order_id,
                        OrderStatus::OrderCreatedExport,
                        TransitionFields::default(),
                    )
                    .await?;
            }
            Err(e) => {
                self.notifier
                    .alert_operator(&format!(
                        "Export failed for paid order {}: {e}",
                        order.order_number
                    ))
                    .await;
                return Err(e.context("post-payment export failed"));
            }
        }

        let tracking_number = generate_tracking_number();
        match self
            .orders
            .transition(
                order_id,
                OrderStatus::TrackingIssued,
                TransitionFields {
                    tracking_number: Some(tracking_number.clone()),
                    ..TransitionFields::default()
                },
            )
            .await
        {
            Ok(order) => {
                tracing::info!(
                    order_number = %order.order_number,
                    tracking_number = %tracking_number,
                    "tracking issued"
                );
                Ok(())
            }
            Err(e) => {
                self.notifier
                    .alert_operator(&format!(
                        "Tracking issuance failed for order {}: {e}",
                        order.order_number
                    ))
                    .await;
                Err(anyhow::Error::from(e).context("tracking issuance failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_numbers_follow_the_format() {
        let number = generate_tracking_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TRACK");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }
}
