use crate::error::{DispatchError, DispatchResult};
use crate::traits::ChannelAdapter;
use crate::types::{
    Channel, ClarificationRequest, IdentityKey, OrderConfirmation, RawMessage,
    render_clarification, render_confirmation,
};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Email adapter: delivers notifications through a mail relay
/// (`POST {send_url}` with `{to, subject, body}`).
#[derive(Clone)]
pub struct EmailAdapter {
    http: reqwest::Client,
    send_url: String,
    from_address: String,
    auth_token: Option<String>,
}

impl EmailAdapter {
    pub fn new(
        send_url: &str,
        from_address: &str,
        auth_token: Option<String>,
    ) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            send_url: send_url.to_string(),
            from_address: from_address.to_string(),
            auth_token,
        })
    }

    pub(crate) async fn post_mail(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> DispatchResult<()> {
        let recipient = recipient.trim();
        if recipient.is_empty() || !recipient.contains('@') {
            return Err(DispatchError::InvalidRecipient(format!(
                "bad email recipient: {recipient:?}"
            )));
        }
        let mut request = self.http.post(&self.send_url).json(&json!({
            "from": self.from_address,
            "to": recipient,
            "subject": subject,
            "body": body,
        }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DispatchError::from_status(status.as_u16(), text));
        }
        tracing::debug!(recipient, subject, "email notification delivered");
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey> {
        message
            .email
            .as_deref()
            .filter(|addr| addr.contains('@'))
            .map(|addr| IdentityKey::new(format!("email:{}", addr.trim().to_lowercase())))
    }

    async fn send_text(&self, recipient: &str, text: &str) -> DispatchResult<()> {
        self.post_mail(recipient, "Your order", text).await
    }

    async fn send_clarification(
        &self,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> DispatchResult<()> {
        let subject = match &request.order_number {
            Some(number) => format!("[clarification] Order {number}"),
            None => "[clarification] Your order".to_string(),
        };
        self.post_mail(recipient, &subject, &render_clarification(request))
            .await
    }

    async fn send_confirmation(
        &self,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> DispatchResult<()> {
        let subject = format!("Order {} confirmed", confirmation.order_number);
        self.post_mail(recipient, &subject, &render_confirmation(confirmation))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn identity_normalizes_the_address() {
        let adapter =
            EmailAdapter::new("http://relay.test/mail", "orders@shop.test", None).expect("adapter");
        let message = RawMessage {
            channel: Channel::Email,
            message_id: None,
            timestamp: Utc::now(),
            text: None,
            subject: Some("order".to_string()),
            body: None,
            form_data: None,
            attachments: vec![],
            chat_user_id: None,
            email: Some("Jane.Doe@Example.COM".to_string()),
            customer_name: None,
            phone: None,
            known_address: None,
            existing_order_id: None,
            context_products: None,
        };
        let identity = adapter.identity_of(&message).expect("identity");
        assert_eq!(identity.as_str(), "email:jane.doe@example.com");
    }
}
