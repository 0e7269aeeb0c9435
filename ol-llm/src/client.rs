use crate::ExtractionModel;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, ResponseFormat, Role};
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const EXTRACTION_TEMPERATURE: f32 = 0.2;
const EXTRACTION_MAX_TOKENS: u32 = 2000;

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Network(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn chat_json(&self, system: &str, user: &str) -> Result<String> {
        let messages = [
            ChatMessage {
                role: Role::System,
                content: system.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: user.to_string(),
            },
        ];
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: EXTRACTION_TEMPERATURE,
            max_tokens: EXTRACTION_MAX_TOKENS,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                LlmError::ResponseFormat("chat completion carried no content".to_string())
            })?;
        tracing::debug!(content_len = content.len(), "extraction response received");
        Ok(content)
    }
}

fn classify_status(status: u16, body: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Auth(format!("status={status} body={body}")),
        429 => LlmError::RateLimited(body),
        500..=599 => LlmError::Server {
            status,
            message: body,
        },
        _ => LlmError::Client {
            status,
            message: body,
        },
    }
}

#[async_trait]
impl ExtractionModel for LlmClient {
    async fn extract(&self, system: &str, prompt: &str) -> Result<String> {
        self.chat_json(system, prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_the_error_taxonomy() {
        assert!(matches!(
            classify_status(401, String::new()),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(503, String::new()),
            LlmError::Server { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(404, String::new()),
            LlmError::Client { status: 404, .. }
        ));
    }

    #[test]
    fn response_content_is_extracted() {
        let body = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "{\"products\": []}"}}
            ]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).expect("parse");
        let content = parsed.choices[0].message.content.as_deref();
        assert_eq!(content, Some(r#"{"products": []}"#));
    }

    #[test]
    fn empty_key_and_model_are_rejected() {
        assert!(LlmClient::new("", "gpt-4o-mini", None).is_err());
        assert!(LlmClient::new("sk-test", " ", None).is_err());
    }
}
