use crate::error::DispatchResult;
use crate::types::{Channel, ClarificationRequest, IdentityKey, OrderConfirmation, RawMessage};
use async_trait::async_trait;

/// One adapter per channel variant. Adapters own identity extraction and
/// the channel-appropriate rendering of outbound notifications; the
/// app-layer dispatcher owns breakers, retries and supervision.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Stable identity key for the sender of an inbound message, used for
    /// clarification-context lookups and synthesized message ids.
    fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey>;

    /// Send a plain text notice (errors, operator alerts).
    async fn send_text(&self, recipient: &str, text: &str) -> DispatchResult<()>;

    /// Send a clarification request listing the unresolved questions.
    async fn send_clarification(
        &self,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> DispatchResult<()>;

    /// Send an order confirmation.
    async fn send_confirmation(
        &self,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> DispatchResult<()>;
}
