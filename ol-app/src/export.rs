//! Invoice export to the ERP collaborator: payload shaping, the HTTP
//! client, and the breaker/retry wrapper around it.

use crate::breaker::{BreakerError, CircuitBreaker, RetryPolicy, retry_with_backoff};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ol_store::Order;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("export service unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("export rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ExportError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::Unavailable { .. }
        )
    }

    fn from_status(status: u16, message: String) -> Self {
        if status == 429 || (500..=599).contains(&status) {
            Self::Unavailable { status, message }
        } else {
            Self::Rejected { status, message }
        }
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportLine {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
}

/// Invoice payload submitted to the export service.
#[derive(Debug, Clone, Serialize)]
pub struct InvoicePayload {
    pub order_number: String,
    pub invoice_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub lines: Vec<ExportLine>,
    pub delivery_cost: f64,
    pub total_amount: f64,
}

impl InvoicePayload {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_number: order.order_number.clone(),
            invoice_number: order.invoice_number.clone(),
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            customer_address: order.customer_address.clone(),
            lines: order
                .items
                .iter()
                .map(|item| ExportLine {
                    code: item.code.clone(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total(),
                })
                .collect(),
            delivery_cost: order.delivery_cost,
            total_amount: order.total_amount,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportAck {
    #[serde(default)]
    pub reference: Option<String>,
}

/// Submit contract against the export collaborator.
#[async_trait]
pub trait ExportService: Send + Sync {
    async fn submit(&self, payload: &InvoicePayload) -> std::result::Result<ExportAck, ExportError>;
}

pub struct HttpExportClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpExportClient {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("export http client build failed")?;
        Ok(Self {
            http,
            url: url.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ExportService for HttpExportClient {
    async fn submit(&self, payload: &InvoicePayload) -> std::result::Result<ExportAck, ExportError> {
        let mut request = self.http.post(&self.url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::from_status(status.as_u16(), body));
        }
        let ack = response.json::<ExportAck>().await.unwrap_or_default();
        Ok(ack)
    }
}

/// Export wrapper owning the breaker and retry policy for the ERP call.
pub struct Exporter {
    service: Arc<dyn ExportService>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl Exporter {
    pub fn new(service: Arc<dyn ExportService>, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            service,
            breaker,
            retry,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(order_number = %order.order_number))]
    pub async fn export_order(&self, order: &Order) -> Result<ExportAck> {
        let payload = InvoicePayload::from_order(order);
        let result = self
            .breaker
            .call(|| {
                retry_with_backoff(&self.retry, "export", ExportError::is_transient, || {
                    self.service.submit(&payload)
                })
            })
            .await;
        match result {
            Ok(ack) => {
                tracing::info!(reference = ?ack.reference, "invoice exported");
                Ok(ack)
            }
            Err(BreakerError::Open(name)) => {
                anyhow::bail!("export breaker '{name}' is open, invoice not submitted")
            }
            Err(BreakerError::Inner(e)) => Err(e).context("invoice export failed"),
        }
    }
}
