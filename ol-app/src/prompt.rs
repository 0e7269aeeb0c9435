//! Prompt construction for the two extraction modes.

use crate::catalog::CatalogItem;
use ol_store::ContextProduct;

pub const SYSTEM_PROMPT: &str = "You extract structured order data. Reply with a single valid JSON object and nothing else.";

pub fn format_catalog(catalog: &[CatalogItem]) -> String {
    let rows: Vec<serde_json::Value> = catalog
        .iter()
        .map(|item| {
            serde_json::json!({
                "code": item.code,
                "name": item.name,
                "price": item.price,
                "stock": item.stock,
            })
        })
        .collect();
    serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
}

fn known_customer_block(
    known_name: Option<&str>,
    known_phone: Option<&str>,
    known_address: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(name) = known_name {
        parts.push(format!("name: {name}"));
    }
    if let Some(phone) = known_phone {
        parts.push(format!("phone: {phone}"));
    }
    if let Some(address) = known_address {
        parts.push(format!("address: {address}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(
            "\nAlready known customer data (do not ask again, do not list as missing):\n{}\n",
            parts.join("\n")
        )
    }
}

const RESPONSE_SHAPE: &str = r#"Return only JSON of this shape:
{
  "products": [
    {"code": "WX-1001", "name": "name from the catalog", "quantity": 2, "price_mentioned": 25.0}
  ],
  "customer": {"name": "Jane Doe", "phone": "+15550100199", "address": "Springfield, 123 Main St"},
  "missing_data": ["name", "phone", "address"],
  "unfound_products": ["product name the catalog does not carry"]
}"#;

const SHARED_RULES: &str = r#"Rules:
- Use exact codes and names from the catalog only.
- A product not in the catalog goes into unfound_products, never into products.
- Quantity defaults to 1 when the message names a product without a count.
- ADDRESS: a usable address contains a street and a house number. If only a
  city or region is given, set address to null and add "address" to missing_data.
- Never invent customer data; anything absent goes into missing_data."#;

pub fn fresh_order_prompt(
    catalog_json: &str,
    customer_message: &str,
    known_name: Option<&str>,
    known_phone: Option<&str>,
) -> String {
    format!(
        "Extract the order from this customer message.\n\n\
         Product catalog:\n{catalog_json}\n\n\
         Customer message:\n{customer_message}\n{known}\n\
         {RESPONSE_SHAPE}\n\n{SHARED_RULES}",
        known = known_customer_block(known_name, known_phone, None),
    )
}

pub fn clarification_reply_prompt(
    catalog_json: &str,
    customer_reply: &str,
    current_products: &[ContextProduct],
    known_name: Option<&str>,
    known_phone: Option<&str>,
    known_address: Option<&str>,
) -> String {
    let current = serde_json::to_string_pretty(current_products).unwrap_or_else(|_| "[]".to_string());
    format!(
        "The customer is clarifying an existing order. Produce the FINAL order\n\
         state after applying their reply to the current products.\n\n\
         Product catalog:\n{catalog_json}\n\n\
         Current products in the order:\n{current}\n\n\
         Customer reply:\n{customer_reply}\n{known}\n\
         {RESPONSE_SHAPE}\n\n{SHARED_RULES}\n\
         Reply-specific rules:\n\
         - Products the reply does not mention stay in the order unchanged.\n\
         - An explicit removal (\"drop X\", \"no longer need X\", \"remove X\") deletes that product.\n\
         - A new quantity for a product replaces its old quantity.\n\
         - Newly named catalog products are added.",
        known = known_customer_block(known_name, known_phone, known_address),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_prompt_carries_current_products_and_known_fields() {
        let catalog = vec![CatalogItem {
            code: "WX-1001".to_string(),
            name: "Widget".to_string(),
            price: 25.0,
            stock: 5,
        }];
        let products = vec![ContextProduct {
            code: "WX-1001".to_string(),
            name: "Widget".to_string(),
            quantity: 2,
        }];
        let prompt = clarification_reply_prompt(
            &format_catalog(&catalog),
            "my phone is +15550100199",
            &products,
            Some("Jane Doe"),
            None,
            None,
        );
        assert!(prompt.contains("WX-1001"));
        assert!(prompt.contains("stay in the order unchanged"));
        assert!(prompt.contains("name: Jane Doe"));
        assert!(!prompt.contains("phone: +"));
    }

    #[test]
    fn fresh_prompt_embeds_catalog_and_message() {
        let prompt = fresh_order_prompt("[]", "2 widgets", None, None);
        assert!(prompt.contains("2 widgets"));
        assert!(prompt.contains("missing_data"));
    }
}
