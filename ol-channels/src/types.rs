use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(IdentityKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Email,
    Form,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Email => "email",
            Self::Form => "form",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

/// Product snapshot on the wire, carried when a queued message continues an
/// existing clarification dialog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProduct {
    pub code: String,
    pub name: String,
    pub quantity: u32,
}

/// The common queue message shape every adapter produces.
///
/// Channel-specific payload fields are optional; [`RawMessage::content`]
/// flattens whichever is present into the text handed to the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel: Channel,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub form_data: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub chat_user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub known_address: Option<String>,

    #[serde(default)]
    pub existing_order_id: Option<Uuid>,
    #[serde(default)]
    pub context_products: Option<Vec<MessageProduct>>,
}

impl RawMessage {
    /// Free text handed to the parser, regardless of channel.
    pub fn content(&self) -> String {
        match self.channel {
            Channel::Chat => self.text.clone().unwrap_or_default(),
            Channel::Email => self
                .body
                .clone()
                .or_else(|| self.subject.clone())
                .unwrap_or_default(),
            Channel::Form => self
                .form_data
                .as_ref()
                .map(|data| {
                    data.iter()
                        .map(|(key, value)| format!("{key}: {value}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default(),
        }
    }

    /// Recipient handle for outbound sends on this message's channel.
    pub fn reply_recipient(&self) -> Option<&str> {
        match self.channel {
            Channel::Chat => self.chat_user_id.as_deref(),
            Channel::Email | Channel::Form => self.email.as_deref(),
        }
    }
}

/// Clarification request payload; adapters render it channel-appropriately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub order_number: Option<String>,
    pub questions: Vec<String>,
    pub unfound_products: Vec<String>,
    pub parsed_products: Vec<MessageProduct>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLine {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_number: String,
    pub lines: Vec<OrderLine>,
    pub delivery_cost: f64,
    pub total_amount: f64,
    pub invoice_number: Option<String>,
}

pub(crate) fn render_clarification(request: &ClarificationRequest) -> String {
    let mut out = String::new();
    match &request.order_number {
        Some(number) => out.push_str(&format!(
            "We need a few details to complete order {number}:\n"
        )),
        None => out.push_str("We need a few details to complete your order:\n"),
    }
    for question in &request.questions {
        out.push_str(&format!("- {question}\n"));
    }
    if !request.unfound_products.is_empty() {
        out.push_str("\nWe could not find these products in our catalog:\n");
        for name in &request.unfound_products {
            out.push_str(&format!("- {name}\n"));
        }
    }
    if !request.parsed_products.is_empty() {
        out.push_str("\nSo far we have:\n");
        for product in &request.parsed_products {
            out.push_str(&format!(
                "- {} x{} ({})\n",
                product.name, product.quantity, product.code
            ));
        }
    }
    out
}

pub(crate) fn render_confirmation(confirmation: &OrderConfirmation) -> String {
    let mut out = format!("Order {} confirmed.\n\nItems:\n", confirmation.order_number);
    for line in &confirmation.lines {
        out.push_str(&format!(
            "- {} x{} @ {:.2}\n",
            line.name, line.quantity, line.unit_price
        ));
    }
    out.push_str(&format!("Delivery: {:.2}\n", confirmation.delivery_cost));
    out.push_str(&format!("Total: {:.2}\n", confirmation.total_amount));
    if let Some(invoice) = &confirmation.invoice_number {
        out.push_str(&format!("Invoice: {invoice}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_message(channel: Channel) -> RawMessage {
        RawMessage {
            channel,
            message_id: None,
            timestamp: Utc::now(),
            text: None,
            subject: None,
            body: None,
            form_data: None,
            attachments: vec![],
            chat_user_id: None,
            email: None,
            customer_name: None,
            phone: None,
            known_address: None,
            existing_order_id: None,
            context_products: None,
        }
    }

    #[test]
    fn content_flattens_form_fields() {
        let mut msg = base_message(Channel::Form);
        let mut data = BTreeMap::new();
        data.insert("order".to_string(), "2 widgets".to_string());
        data.insert("phone".to_string(), "+15550100".to_string());
        msg.form_data = Some(data);

        let content = msg.content();
        assert!(content.contains("order: 2 widgets"));
        assert!(content.contains("phone: +15550100"));
    }

    #[test]
    fn email_content_falls_back_to_subject() {
        let mut msg = base_message(Channel::Email);
        msg.subject = Some("Need 3 gaskets".to_string());
        assert_eq!(msg.content(), "Need 3 gaskets");

        msg.body = Some("Please send 3 gaskets".to_string());
        assert_eq!(msg.content(), "Please send 3 gaskets");
    }

    #[test]
    fn rendered_clarification_lists_every_question() {
        let request = ClarificationRequest {
            order_number: Some("ORD-2026-0007".to_string()),
            questions: vec![
                "Please share your phone number".to_string(),
                "Please confirm the delivery address".to_string(),
            ],
            unfound_products: vec!["Mystery Widget".to_string()],
            parsed_products: vec![MessageProduct {
                code: "WX-1001".to_string(),
                name: "Widget".to_string(),
                quantity: 2,
            }],
        };
        let text = render_clarification(&request);
        assert!(text.contains("ORD-2026-0007"));
        assert!(text.contains("phone number"));
        assert!(text.contains("delivery address"));
        assert!(text.contains("Mystery Widget"));
        assert!(text.contains("Widget x2"));
    }

    #[test]
    fn queue_shape_round_trips_through_json() {
        let mut msg = base_message(Channel::Chat);
        msg.message_id = Some(MessageId::new("m-17"));
        msg.text = Some("2 widgets please".to_string());
        msg.chat_user_id = Some("42".to_string());

        let json = serde_json::to_string(&msg).expect("serialize");
        let back: RawMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.channel, Channel::Chat);
        assert_eq!(back.message_id.as_ref().map(|m| m.as_str()), Some("m-17"));
        assert_eq!(back.reply_recipient(), Some("42"));
    }
}
