//! Deterministic catalog matching and text heuristics: exact code lookup,
//! fuzzy name matching, and the quantity/phone/address extraction used by
//! the fallback parser and by validation.

use crate::catalog::CatalogItem;
use regex::Regex;
use std::sync::OnceLock;

/// Relevance floor for accepting a fuzzy name match during validation.
pub const VALIDATION_RELEVANCE_FLOOR: f64 = 0.7;
/// Relevance floor for product discovery in the fallback parser.
pub const DISCOVERY_RELEVANCE_FLOOR: f64 = 0.5;

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[A-Z]{2,4}-\d{3,8}\b").expect("static regex"))
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z]{3,}").expect("static regex"))
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s\-().]{7,18}\d").expect("static regex"))
}

const STREET_TOKENS: &[&str] = &[
    "street", "st", "avenue", "ave", "av", "road", "rd", "lane", "ln", "boulevard", "blvd",
    "drive", "dr", "way", "court", "ct", "place", "pl", "square", "sq", "highway", "hwy",
    "terrace", "ter", "crescent", "parkway", "pkwy",
];

pub fn find_by_code<'a>(code: &str, catalog: &'a [CatalogItem]) -> Option<&'a CatalogItem> {
    let needle = code.trim();
    if needle.is_empty() {
        return None;
    }
    catalog
        .iter()
        .find(|item| item.code.trim().eq_ignore_ascii_case(needle))
}

fn score_name(query: &str, candidate: &str) -> f64 {
    let query = query.trim().to_lowercase();
    let candidate = candidate.trim().to_lowercase();
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let mut score = strsim::jaro_winkler(&query, &candidate);
    if query.len() >= 3 && (candidate.contains(&query) || query.contains(&candidate)) {
        score = score.max(0.9);
    }
    score
}

/// Best fuzzy matches for a free-text product name, strongest first.
pub fn find_by_name_fuzzy<'a>(
    name: &str,
    catalog: &'a [CatalogItem],
    limit: usize,
) -> Vec<(&'a CatalogItem, f64)> {
    let mut scored: Vec<(&CatalogItem, f64)> = catalog
        .iter()
        .map(|item| (item, score_name(name, &item.name)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    scored
}

/// Product codes mentioned in free text, uppercased, first-seen order.
pub fn extract_codes(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for found in code_regex().find_iter(text) {
        let code = found.as_str().to_uppercase();
        if !seen.contains(&code) {
            seen.push(code);
        }
    }
    seen
}

/// Quantity mentioned near a product reference; defaults to 1.
pub fn extract_quantity(text: &str, product_name: Option<&str>) -> u32 {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(\d+)\s*(?:x|pcs?|pieces?|units?)\b",
            r"(?i)\b(?:x|qty|quantity)[:\s]*(\d+)\b",
            r"(?i)\b(\d+)\s+of\b",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static regex"))
        .collect()
    });

    for pattern in patterns {
        if let Some(captures) = pattern.captures(text) {
            if let Some(quantity) = captures.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                if quantity > 0 {
                    return quantity;
                }
            }
        }
    }

    if let Some(name) = product_name {
        let name = regex::escape(name.trim());
        if !name.is_empty() {
            if let Ok(near) = Regex::new(&format!(r"(?i)\b(\d+)\s+{name}\b|\b{name}\s*[:x\-]?\s*(\d+)\b")) {
                if let Some(captures) = near.captures(text) {
                    let quantity = captures
                        .get(1)
                        .or_else(|| captures.get(2))
                        .and_then(|m| m.as_str().parse::<u32>().ok());
                    if let Some(quantity) = quantity {
                        if quantity > 0 {
                            return quantity;
                        }
                    }
                }
            }
        }
    }

    1
}

/// First phone-shaped run of digits in the text, normalized.
pub fn extract_phone(text: &str) -> Option<String> {
    phone_regex()
        .find_iter(text)
        .find_map(|found| normalize_phone(found.as_str()))
}

/// Canonical `+<digits>` form; rejects runs that cannot be a phone number.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if (10..=15).contains(&digits.len()) {
        Some(format!("+{digits}"))
    } else {
        None
    }
}

/// A deliverable address needs BOTH a street-type token and a house-number
/// token. "City only" is treated as missing.
pub fn is_address_complete(address: &str) -> bool {
    let lowered = address.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();

    let has_street = tokens.iter().any(|token| STREET_TOKENS.contains(token));
    let has_house = tokens.iter().any(|token| {
        let digits = token.chars().take_while(char::is_ascii_digit).count();
        digits >= 1 && digits <= 5 && token.len() <= digits + 1
    });
    has_street && has_house
}

/// Heuristic address extraction for the fallback parser: the first text
/// segment that carries a street token.
pub fn extract_address(text: &str) -> Option<String> {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let label = LABEL.get_or_init(|| {
        Regex::new(r"(?i)^(?:delivery\s+)?(?:address|ship\s+to|deliver\s+to)[:\s]+")
            .expect("static regex")
    });

    for segment in text.split(['\n', ';']) {
        let segment = label.replace(segment.trim(), "").to_string();
        if segment.is_empty() {
            continue;
        }
        let lowered = segment.to_lowercase();
        let has_street = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
            .any(|token| STREET_TOKENS.contains(&token));
        if has_street {
            return Some(segment);
        }
    }
    None
}

/// Catalog matches discovered in free text: exact codes first, then fuzzy
/// word matches, deduplicated by code and sorted by relevance.
pub fn match_products_from_text(
    text: &str,
    catalog: &[CatalogItem],
    max_results: usize,
) -> Vec<(CatalogItem, f64, u32)> {
    let mut results: Vec<(CatalogItem, f64, u32)> = Vec::new();

    for code in extract_codes(text) {
        if let Some(item) = find_by_code(&code, catalog) {
            let quantity = extract_quantity(text, Some(&item.name));
            results.push((item.clone(), 1.0, quantity));
        }
    }

    for word in word_regex().find_iter(text) {
        for (item, relevance) in find_by_name_fuzzy(word.as_str(), catalog, 3) {
            if results.iter().any(|(seen, _, _)| seen.code == item.code) {
                continue;
            }
            let quantity = extract_quantity(text, Some(&item.name));
            results.push((item.clone(), relevance, quantity));
        }
    }

    results.sort_by(|a, b| b.1.total_cmp(&a.1));
    results.truncate(max_results);
    results
}

pub fn in_stock(item: &CatalogItem, requested: u32) -> bool {
    item.stock >= requested
}
