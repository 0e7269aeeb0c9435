//! Delivery cost calculation: zone table keyed by normalized city name,
//! tiered by shipment weight. The city is taken from the first segment of
//! the delivery address.

use ol_store::OrderItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_ZONE: &str = "default";
// Weight heuristic until the catalog carries real weights.
const KG_PER_UNIT: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTier {
    pub max_weight: f64,
    pub cost: f64,
    pub days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRules {
    pub zones: BTreeMap<String, Vec<WeightTier>>,
}

impl Default for DeliveryRules {
    fn default() -> Self {
        let mut zones = BTreeMap::new();
        zones.insert(
            "metro".to_string(),
            vec![
                WeightTier { max_weight: 5.0, cost: 5.0, days: 1 },
                WeightTier { max_weight: 10.0, cost: 8.0, days: 2 },
                WeightTier { max_weight: f64::INFINITY, cost: 12.0, days: 3 },
            ],
        );
        zones.insert(
            DEFAULT_ZONE.to_string(),
            vec![
                WeightTier { max_weight: 5.0, cost: 10.0, days: 3 },
                WeightTier { max_weight: 10.0, cost: 15.0, days: 5 },
                WeightTier { max_weight: f64::INFINITY, cost: 20.0, days: 7 },
            ],
        );
        Self { zones }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryQuote {
    pub zone: String,
    pub weight: f64,
    pub cost: f64,
    pub estimated_days: u32,
}

#[derive(Clone)]
pub struct DeliveryCalculator {
    rules: DeliveryRules,
}

impl DeliveryCalculator {
    pub fn new(rules: DeliveryRules) -> Self {
        Self { rules }
    }

    pub fn quote(&self, city: &str, items: &[OrderItem]) -> DeliveryQuote {
        let zone = self.normalize_zone(city);
        let weight = shipment_weight(items);
        let tiers = self
            .rules
            .zones
            .get(&zone)
            .or_else(|| self.rules.zones.get(DEFAULT_ZONE));

        let tier = tiers.and_then(|tiers| {
            tiers
                .iter()
                .find(|tier| weight <= tier.max_weight)
                .or_else(|| tiers.last())
        });

        match tier {
            Some(tier) => DeliveryQuote {
                zone,
                weight,
                cost: tier.cost,
                estimated_days: tier.days,
            },
            // No usable tier table at all; charge the conservative ceiling.
            None => DeliveryQuote {
                zone,
                weight,
                cost: 20.0,
                estimated_days: 7,
            },
        }
    }

    /// Quote from a delivery address. The city is the first comma-separated
    /// segment; a missing address falls into the default zone.
    pub fn quote_for_address(&self, address: Option<&str>, items: &[OrderItem]) -> DeliveryQuote {
        let city = address
            .and_then(|addr| addr.split(',').next())
            .map(str::trim)
            .filter(|city| !city.is_empty())
            .unwrap_or(DEFAULT_ZONE);
        self.quote(city, items)
    }

    fn normalize_zone(&self, city: &str) -> String {
        let normalized = city.trim().to_lowercase();
        if self.rules.zones.contains_key(&normalized) {
            normalized
        } else {
            DEFAULT_ZONE.to_string()
        }
    }
}

fn shipment_weight(items: &[OrderItem]) -> f64 {
    let units: u32 = items.iter().map(|item| item.quantity).sum();
    (units.max(1)) as f64 * KG_PER_UNIT
}
