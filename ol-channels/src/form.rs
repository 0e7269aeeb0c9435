use crate::email::EmailAdapter;
use crate::error::DispatchResult;
use crate::traits::ChannelAdapter;
use crate::types::{Channel, ClarificationRequest, IdentityKey, OrderConfirmation, RawMessage};
use async_trait::async_trait;

/// Web-form adapter. Form submissions are one-shot, so replies travel over
/// the submitter's email address; outbound sends delegate to the same mail
/// relay the email adapter uses.
#[derive(Clone)]
pub struct FormAdapter {
    mailer: EmailAdapter,
}

impl FormAdapter {
    pub fn new(send_url: &str, from_address: &str, auth_token: Option<String>) -> DispatchResult<Self> {
        Ok(Self {
            mailer: EmailAdapter::new(send_url, from_address, auth_token)?,
        })
    }
}

#[async_trait]
impl ChannelAdapter for FormAdapter {
    fn channel(&self) -> Channel {
        Channel::Form
    }

    fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey> {
        message
            .email
            .as_deref()
            .filter(|addr| addr.contains('@'))
            .map(|addr| IdentityKey::new(format!("form:{}", addr.trim().to_lowercase())))
    }

    async fn send_text(&self, recipient: &str, text: &str) -> DispatchResult<()> {
        self.mailer.post_mail(recipient, "Your order", text).await
    }

    async fn send_clarification(
        &self,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> DispatchResult<()> {
        self.mailer.send_clarification(recipient, request).await
    }

    async fn send_confirmation(
        &self,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> DispatchResult<()> {
        self.mailer.send_confirmation(recipient, confirmation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn form_identity_is_distinct_from_email_identity() {
        let adapter =
            FormAdapter::new("http://relay.test/mail", "orders@shop.test", None).expect("adapter");
        let message = RawMessage {
            channel: Channel::Form,
            message_id: None,
            timestamp: Utc::now(),
            text: None,
            subject: None,
            body: None,
            form_data: None,
            attachments: vec![],
            chat_user_id: None,
            email: Some("jane@example.com".to_string()),
            customer_name: None,
            phone: None,
            known_address: None,
            existing_order_id: None,
            context_products: None,
        };
        let identity = adapter.identity_of(&message).expect("identity");
        assert_eq!(identity.as_str(), "form:jane@example.com");
    }
}
