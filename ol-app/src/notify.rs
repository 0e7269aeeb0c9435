//! Notification dispatch: fan-out to channel adapters behind the messaging
//! circuit breaker, plus the operator alert path for post-payment failures.

use crate::breaker::{BreakerError, CircuitBreaker, RetryPolicy, retry_with_backoff};
use anyhow::{Context, Result};
use ol_channels::{
    Channel, ChannelAdapter, ClarificationRequest, DispatchError, IdentityKey, OrderConfirmation,
    RawMessage,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct OperatorChannel {
    pub channel: Channel,
    pub recipient: String,
}

pub struct NotificationDispatcher {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    operator: Option<OperatorChannel>,
}

impl NotificationDispatcher {
    pub fn new(
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        operator: Option<OperatorChannel>,
    ) -> Self {
        Self {
            adapters,
            breaker,
            retry,
            operator,
        }
    }

    pub fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey> {
        self.adapters
            .get(&message.channel)
            .and_then(|adapter| adapter.identity_of(message))
    }

    fn adapter(&self, channel: Channel) -> Result<&Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(&channel)
            .with_context(|| format!("no adapter configured for channel {channel}"))
    }

    async fn dispatch<F, Fut>(&self, label: &str, send: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), DispatchError>>,
    {
        let result = self
            .breaker
            .call(|| {
                retry_with_backoff(&self.retry, label, DispatchError::is_transient, || send())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(BreakerError::Open(name)) => {
                anyhow::bail!("messaging breaker '{name}' is open, {label} not sent")
            }
            Err(BreakerError::Inner(e)) => Err(e).context(format!("{label} dispatch failed")),
        }
    }

    pub async fn send_clarification(
        &self,
        channel: Channel,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> Result<()> {
        let adapter = self.adapter(channel)?;
        self.dispatch("clarification", || {
            adapter.send_clarification(recipient, request)
        })
        .await?;
        tracing::info!(
            %channel,
            recipient,
            questions = request.questions.len(),
            "clarification request sent"
        );
        Ok(())
    }

    pub async fn send_confirmation(
        &self,
        channel: Channel,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> Result<()> {
        let adapter = self.adapter(channel)?;
        self.dispatch("confirmation", || {
            adapter.send_confirmation(recipient, confirmation)
        })
        .await?;
        tracing::info!(
            %channel,
            recipient,
            order_number = %confirmation.order_number,
            "order confirmation sent"
        );
        Ok(())
    }

    pub async fn send_text(&self, channel: Channel, recipient: &str, text: &str) -> Result<()> {
        let adapter = self.adapter(channel)?;
        self.dispatch("text", || adapter.send_text(recipient, text))
            .await
    }

    /// Best-effort operator alert for failures the customer must not see
    /// (payment already confirmed). Failures are logged, never propagated.
    pub async fn alert_operator(&self, text: &str) {
        let Some(operator) = &self.operator else {
            tracing::warn!(alert = text, "operator alert dropped: no operator channel configured");
            return;
        };
        match self
            .send_text(operator.channel, &operator.recipient, text)
            .await
        {
            Ok(()) => tracing::info!(channel = %operator.channel, "operator alerted"),
            Err(e) => tracing::error!(%e, alert = text, "operator alert failed"),
        }
    }
}
