//! Destination pricing

use otpgate_common::config::{PriceConfig, PricingConfig};
use otpgate_common::types::MessageClass;
use otpgate_common::{Error, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One priced destination prefix
#[derive(Debug, Clone)]
pub struct RateEntry {
    /// `country_code` followed by the network prefix, digits only
    pub full_prefix: String,
    pub country_code: String,
    pub operator: String,
    prices: HashMap<String, PriceConfig>,
}

/// Price of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub operator: String,
    pub prefix: String,
    pub currency: String,
    pub unit_price: Decimal,
    pub parts: u32,
    pub total: Decimal,
}

/// Immutable table of destination prices, sorted longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    entries: Vec<RateEntry>,
}

impl RateTable {
    pub fn from_config(config: &PricingConfig) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.rates.len());
        for rate in &config.rates {
            let full_prefix = format!("{}{}", rate.country_code, rate.prefix);
            if full_prefix.is_empty() || !full_prefix.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::Config(format!(
                    "pricing prefix '{}' must be digits only",
                    full_prefix
                )));
            }
            let prices = rate
                .prices
                .iter()
                .map(|(currency, price)| (currency.to_uppercase(), price.clone()))
                .collect();
            entries.push(RateEntry {
                full_prefix,
                country_code: rate.country_code.clone(),
                operator: rate.operator.clone(),
                prices,
            });
        }
        entries.sort_by(|a, b| b.full_prefix.len().cmp(&a.full_prefix.len()));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry with the longest prefix matching `digits`
    pub fn lookup(&self, digits: &str) -> Option<&RateEntry> {
        self.entries
            .iter()
            .find(|entry| digits.starts_with(&entry.full_prefix))
    }

    /// Price `parts` segments of class `class` to `destination` in `currency`.
    pub fn quote(
        &self,
        destination: &str,
        class: MessageClass,
        parts: u32,
        currency: &str,
    ) -> Result<Quote> {
        let digits: String = destination.chars().filter(|c| c.is_ascii_digit()).collect();
        let entry = self
            .lookup(&digits)
            .ok_or_else(|| Error::UnknownDestination(destination.to_string()))?;

        let currency = currency.to_uppercase();
        let not_configured = || Error::RateNotConfigured {
            prefix: entry.full_prefix.clone(),
            currency: currency.clone(),
            class: class.as_str().to_string(),
        };

        let price = entry.prices.get(&currency).ok_or_else(not_configured)?;
        let unit_price = match class {
            MessageClass::Service => price.service_price,
            MessageClass::Promotional => price.promo_price.ok_or_else(not_configured)?,
        };
        let total = unit_price * Decimal::from(parts);

        debug!(
            prefix = %entry.full_prefix,
            operator = %entry.operator,
            %unit_price,
            parts,
            "Quoted message"
        );

        Ok(Quote {
            operator: entry.operator.clone(),
            prefix: entry.full_prefix.clone(),
            currency,
            unit_price,
            parts,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otpgate_common::config::RateEntryConfig;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn rate(country_code: &str, prefix: &str, service: Decimal, promo: Option<Decimal>) -> RateEntryConfig {
        let mut prices = HashMap::new();
        prices.insert(
            "uzs".to_string(),
            PriceConfig {
                service_price: service,
                promo_price: promo,
            },
        );
        RateEntryConfig {
            country_code: country_code.to_string(),
            prefix: prefix.to_string(),
            operator: format!("op-{}{}", country_code, prefix),
            prices,
        }
    }

    fn table() -> RateTable {
        RateTable::from_config(&PricingConfig {
            rates: vec![
                rate("998", "", dec!(100), None),
                rate("998", "90", dec!(115), Some(dec!(150))),
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let quote = table()
            .quote("+998901234567", MessageClass::Service, 2, "UZS")
            .unwrap();
        assert_eq!(quote.prefix, "99890");
        assert_eq!(quote.unit_price, dec!(115));
        assert_eq!(quote.total, dec!(230));

        let quote = table()
            .quote("+998931234567", MessageClass::Service, 1, "UZS")
            .unwrap();
        assert_eq!(quote.prefix, "998");
        assert_eq!(quote.total, dec!(100));
    }

    #[test]
    fn test_promotional_price() {
        let quote = table()
            .quote("998901234567", MessageClass::Promotional, 3, "uzs")
            .unwrap();
        assert_eq!(quote.total, dec!(450));
        assert_eq!(quote.currency, "UZS");
    }

    #[test]
    fn test_unknown_destination() {
        assert!(matches!(
            table().quote("+12025550100", MessageClass::Service, 1, "UZS"),
            Err(Error::UnknownDestination(_))
        ));
    }

    #[test]
    fn test_rate_not_configured() {
        assert!(matches!(
            table().quote("+998901234567", MessageClass::Service, 1, "USD"),
            Err(Error::RateNotConfigured { .. })
        ));
        // Whole-country entry has no promotional price
        assert!(matches!(
            table().quote("+998931234567", MessageClass::Promotional, 1, "UZS"),
            Err(Error::RateNotConfigured { .. })
        ));
    }

    #[test]
    fn test_rejects_non_digit_prefix() {
        let config = PricingConfig {
            rates: vec![rate("99x", "", dec!(1), None)],
        };
        assert!(RateTable::from_config(&config).is_err());
    }
}
