//! Channel adapters for Orderline.
//!
//! Adapters normalize inbound customer messages into the common queue shape
//! and carry outbound notifications (clarification requests, order
//! confirmations, plain text) to their channel's relay endpoint. Transport
//! mechanics beyond the relay call — polling, webhook signatures — live
//! outside this crate.

mod chat;
mod email;
mod error;
mod form;
mod traits;
mod types;

pub use chat::ChatAdapter;
pub use email::EmailAdapter;
pub use error::{DispatchError, DispatchResult};
pub use form::FormAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    Attachment, Channel, ClarificationRequest, IdentityKey, MessageId, MessageProduct,
    OrderConfirmation, OrderLine, RawMessage,
};
