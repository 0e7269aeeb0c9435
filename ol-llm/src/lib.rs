//! LLM extraction client for Orderline.
//!
//! Speaks the OpenAI-compatible chat-completions protocol in JSON mode:
//! prompt in, one structured JSON document out. The error taxonomy
//! distinguishes transient failures (retried under the caller's circuit
//! breaker) from permanent ones (never retried).

mod client;
mod error;
mod types;

pub use client::LlmClient;
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role};

use async_trait::async_trait;

/// Text-in / structured-JSON-out extraction contract.
///
/// The production implementation is [`LlmClient`]; tests inject scripted
/// models.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    /// Run one extraction round. Returns the model's raw JSON document.
    async fn extract(&self, system: &str, prompt: &str) -> Result<String>;
}
