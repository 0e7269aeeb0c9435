use crate::error::{DispatchError, DispatchResult};
use crate::traits::ChannelAdapter;
use crate::types::{
    Channel, ClarificationRequest, IdentityKey, OrderConfirmation, RawMessage,
    render_clarification, render_confirmation,
};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Chat adapter: delivers notifications through a bot-API style relay
/// (`POST {send_url}` with `{chat_id, text}`).
#[derive(Clone)]
pub struct ChatAdapter {
    http: reqwest::Client,
    send_url: String,
    auth_token: Option<String>,
}

impl ChatAdapter {
    pub fn new(send_url: &str, auth_token: Option<String>) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            send_url: send_url.to_string(),
            auth_token,
        })
    }

    async fn post_text(&self, recipient: &str, text: &str) -> DispatchResult<()> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(DispatchError::InvalidRecipient(
                "chat recipient is empty".to_string(),
            ));
        }
        let mut request = self.http.post(&self.send_url).json(&json!({
            "chat_id": recipient,
            "text": text,
        }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::from_status(status.as_u16(), body));
        }
        tracing::debug!(recipient, "chat notification delivered");
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for ChatAdapter {
    fn channel(&self) -> Channel {
        Channel::Chat
    }

    fn identity_of(&self, message: &RawMessage) -> Option<IdentityKey> {
        message
            .chat_user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| IdentityKey::new(format!("chat:{id}")))
    }

    async fn send_text(&self, recipient: &str, text: &str) -> DispatchResult<()> {
        self.post_text(recipient, text).await
    }

    async fn send_clarification(
        &self,
        recipient: &str,
        request: &ClarificationRequest,
    ) -> DispatchResult<()> {
        self.post_text(recipient, &render_clarification(request))
            .await
    }

    async fn send_confirmation(
        &self,
        recipient: &str,
        confirmation: &OrderConfirmation,
    ) -> DispatchResult<()> {
        self.post_text(recipient, &render_confirmation(confirmation))
            .await
    }
}
