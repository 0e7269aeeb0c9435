//! AI-assisted order extraction with a deterministic fallback, plus the
//! validation pass shared by both paths.

use crate::breaker::{BreakerError, CircuitBreaker, RetryPolicy, retry_with_backoff};
use crate::catalog::CatalogItem;
use crate::matcher;
use crate::prompt;
use anyhow::Result;
use ol_llm::{ExtractionModel, LlmError};
use ol_store::{ContextProduct, MissingField};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedProduct {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub price_mentioned: Option<f64>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedCustomer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Raw extraction result, before validation. Produced either by the model
/// or by the deterministic fallback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedOrder {
    #[serde(default)]
    pub products: Vec<ExtractedProduct>,
    #[serde(default)]
    pub customer: ExtractedCustomer,
    #[serde(default)]
    pub unfound_products: Vec<String>,
}

/// A product that passed catalog validation. Price and stock always come
/// from the catalog row, never from the message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedProduct {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub available: bool,
    pub stock: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerFields {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Validated,
    NeedsClarification,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub status: ParseStatus,
    pub products: Vec<ValidatedProduct>,
    pub customer: CustomerFields,
    pub missing_data: Vec<MissingField>,
    pub unfound_products: Vec<String>,
    pub clarification_questions: Vec<String>,
}

pub struct ReplyContext<'a> {
    pub products: &'a [ContextProduct],
}

pub struct ParseInput<'a> {
    pub content: &'a str,
    pub catalog: &'a [CatalogItem],
    pub known_name: Option<&'a str>,
    pub known_phone: Option<&'a str>,
    pub known_address: Option<&'a str>,
    pub reply: Option<ReplyContext<'a>>,
}

pub struct OrderParser {
    model: Arc<dyn ExtractionModel>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl OrderParser {
    pub fn new(model: Arc<dyn ExtractionModel>, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            model,
            breaker,
            retry,
        }
    }

    /// Parse and validate one message. Model failures degrade to the
    /// deterministic fallback; only an unusable catalog is an error.
    #[tracing::instrument(level = "info", skip_all, fields(reply = input.reply.is_some()))]
    pub async fn parse(&self, input: &ParseInput<'_>) -> Result<ParseOutcome> {
        if input.catalog.is_empty() {
            anyhow::bail!("catalog is empty; cannot validate order");
        }

        let content = input.content.trim();
        let extracted = if content.is_empty() {
            None
        } else {
            self.extract_with_model(input, content).await
        };

        let mut extracted = match extracted {
            Some(extracted) => extracted,
            None => match &input.reply {
                // A failed extraction on a clarification reply must not
                // invent a fresh order; carry the known dialog state.
                Some(reply) => reply_fallback(reply, input),
                None => fallback_extract(content, input.catalog),
            },
        };
        if let Some(reply) = &input.reply {
            // The customer answered without restating products; the order
            // keeps its current items.
            if extracted.products.is_empty() && !reply.products.is_empty() {
                tracing::info!(
                    context_products = reply.products.len(),
                    "extraction returned no products for a reply, carrying context products"
                );
                extracted.products = context_to_extracted(reply.products);
            }
        }

        Ok(validate(extracted, input))
    }

    async fn extract_with_model(
        &self,
        input: &ParseInput<'_>,
        content: &str,
    ) -> Option<ExtractedOrder> {
        let catalog_json = prompt::format_catalog(input.catalog);
        let user_prompt = match &input.reply {
            Some(reply) => prompt::clarification_reply_prompt(
                &catalog_json,
                content,
                reply.products,
                input.known_name,
                input.known_phone,
                input.known_address,
            ),
            None => prompt::fresh_order_prompt(
                &catalog_json,
                content,
                input.known_name,
                input.known_phone,
            ),
        };

        let result = self
            .breaker
            .call(|| {
                retry_with_backoff(&self.retry, "llm-extract", LlmError::is_transient, || {
                    self.model.extract(prompt::SYSTEM_PROMPT, &user_prompt)
                })
            })
            .await;

        match result {
            Ok(raw) => parse_model_json(&raw),
            Err(BreakerError::Open(name)) => {
                tracing::warn!(breaker = %name, "llm breaker open, using fallback parser");
                None
            }
            Err(BreakerError::Inner(e)) => {
                tracing::error!(%e, "llm extraction failed, using fallback parser");
                None
            }
        }
    }
}

fn parse_model_json(raw: &str) -> Option<ExtractedOrder> {
    // Clip to the outermost braces in case the model wrapped its JSON in prose.
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    match serde_json::from_str(&raw[start..=end]) {
        Ok(extracted) => Some(extracted),
        Err(e) => {
            let preview: String = raw.chars().take(200).collect();
            tracing::error!(%e, %preview, "model response was not valid extraction JSON");
            None
        }
    }
}

fn context_to_extracted(products: &[ContextProduct]) -> Vec<ExtractedProduct> {
    products
        .iter()
        .map(|product| ExtractedProduct {
            code: product.code.clone(),
            name: product.name.clone(),
            quantity: product.quantity.max(1),
            price_mentioned: None,
        })
        .collect()
}

fn reply_fallback(reply: &ReplyContext<'_>, input: &ParseInput<'_>) -> ExtractedOrder {
    ExtractedOrder {
        products: context_to_extracted(reply.products),
        customer: ExtractedCustomer {
            name: input.known_name.map(str::to_string),
            phone: input.known_phone.map(str::to_string),
            address: input.known_address.map(str::to_string),
        },
        unfound_products: Vec::new(),
    }
}

/// Catalog-driven extraction used when the model is unavailable.
fn fallback_extract(content: &str, catalog: &[CatalogItem]) -> ExtractedOrder {
    tracing::info!("running deterministic fallback parser");
    let products = matcher::match_products_from_text(content, catalog, 10)
        .into_iter()
        .filter(|(_, relevance, _)| *relevance >= matcher::DISCOVERY_RELEVANCE_FLOOR)
        .map(|(item, _, quantity)| ExtractedProduct {
            code: item.code,
            name: item.name,
            quantity,
            price_mentioned: None,
        })
        .collect();

    ExtractedOrder {
        products,
        customer: ExtractedCustomer {
            name: None,
            phone: matcher::extract_phone(content),
            address: matcher::extract_address(content),
        },
        unfound_products: Vec::new(),
    }
}

/// Validation shared by the model path and the fallback path.
fn validate(extracted: ExtractedOrder, input: &ParseInput<'_>) -> ParseOutcome {
    let mut products: Vec<ValidatedProduct> = Vec::new();
    let mut unfound_products: Vec<String> = Vec::new();

    for product in &extracted.products {
        let by_code = matcher::find_by_code(&product.code, input.catalog);
        let found = by_code.or_else(|| {
            matcher::find_by_name_fuzzy(&product.name, input.catalog, 3)
                .into_iter()
                .find(|(_, relevance)| *relevance >= matcher::VALIDATION_RELEVANCE_FLOOR)
                .map(|(item, relevance)| {
                    tracing::info!(
                        query = %product.name,
                        matched = %item.name,
                        relevance,
                        "product matched by fuzzy name"
                    );
                    item
                })
        });

        match found {
            Some(item) => {
                let quantity = product.quantity.max(1);
                products.push(ValidatedProduct {
                    code: item.code.clone(),
                    name: item.name.clone(),
                    quantity,
                    unit_price: item.price,
                    available: matcher::in_stock(item, quantity),
                    stock: item.stock,
                });
            }
            None => {
                let label = if product.name.trim().is_empty() {
                    product.code.clone()
                } else {
                    product.name.clone()
                };
                if !label.trim().is_empty() {
                    tracing::warn!(product = %label, "product not found in catalog");
                    unfound_products.push(label);
                }
            }
        }
    }
    for name in extracted.unfound_products {
        if !name.trim().is_empty() && !unfound_products.contains(&name) {
            unfound_products.push(name);
        }
    }

    let customer_name = non_empty(extracted.customer.name)
        .or_else(|| input.known_name.map(str::to_string));
    let customer_phone = non_empty(extracted.customer.phone)
        .as_deref()
        .and_then(matcher::normalize_phone)
        .or_else(|| input.known_phone.and_then(matcher::normalize_phone));
    let raw_address = non_empty(extracted.customer.address)
        .or_else(|| input.known_address.map(str::to_string));
    let customer_address = raw_address
        .clone()
        .filter(|address| matcher::is_address_complete(address));

    let mut missing_data = Vec::new();
    if customer_name.is_none() {
        missing_data.push(MissingField::Name);
    }
    if customer_phone.is_none() {
        missing_data.push(MissingField::Phone);
    }
    if customer_address.is_none() {
        missing_data.push(MissingField::Address);
    }

    let has_unavailable = products.iter().any(|product| !product.available);
    let status = if products.is_empty()
        || !unfound_products.is_empty()
        || !missing_data.is_empty()
        || has_unavailable
    {
        ParseStatus::NeedsClarification
    } else {
        ParseStatus::Validated
    };

    let mut clarification_questions = Vec::new();
    for field in &missing_data {
        match field {
            MissingField::Name => clarification_questions
                .push("Please share the recipient's full name.".to_string()),
            MissingField::Phone => clarification_questions
                .push("Please share a contact phone number.".to_string()),
            MissingField::Address => match &raw_address {
                Some(raw) => clarification_questions.push(format!(
                    "Please send the full delivery address including street and house number; you sent: \"{raw}\"."
                )),
                None => clarification_questions.push(
                    "Please share the full delivery address (city, street, house number)."
                        .to_string(),
                ),
            },
        }
    }
    for name in &unfound_products {
        clarification_questions.push(format!(
            "We could not find \"{name}\" in the catalog; please check the code or name."
        ));
    }
    for product in products.iter().filter(|product| !product.available) {
        clarification_questions.push(format!(
            "Only {} of \"{}\" in stock; you asked for {}. Please confirm the quantity.",
            product.stock, product.name, product.quantity
        ));
    }

    ParseOutcome {
        status,
        products,
        customer: CustomerFields {
            name: customer_name,
            phone: customer_phone,
            address: customer_address,
        },
        missing_data,
        unfound_products,
        clarification_questions,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
