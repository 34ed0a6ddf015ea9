//! Static currency table used to put every listing price in one currency.

use std::collections::HashMap;

use hearth_core::error::AppError;
use hearth_core::models::Property;
use hearth_core::traits::CurrencyConverter;

/// Approximate units per US dollar.
const USD_RATES: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 0.92),
    ("GBP", 0.79),
    ("RUB", 92.0),
    ("CNY", 7.2),
    ("JPY", 150.0),
    ("AUD", 1.52),
    ("CAD", 1.35),
    ("CHF", 0.88),
    ("INR", 83.0),
    ("BRL", 4.95),
    ("MXN", 17.0),
    ("ZAR", 18.5),
    ("SEK", 10.5),
    ("NOK", 10.8),
    ("DKK", 6.85),
    ("PLN", 4.0),
    ("TRY", 30.0),
    ("AED", 3.67),
    ("SGD", 1.34),
    ("HKD", 7.8),
    ("KRW", 1330.0),
    ("THB", 35.0),
    ("IDR", 15700.0),
    ("MYR", 4.7),
    ("PHP", 56.0),
    ("VND", 24500.0),
];

/// USD-based rate table. Conversion goes through USD.
#[derive(Debug, Clone)]
pub struct StaticRates {
    per_usd: HashMap<String, f64>,
}

impl Default for StaticRates {
    fn default() -> Self {
        Self {
            per_usd: USD_RATES
                .iter()
                .map(|(code, rate)| ((*code).to_string(), *rate))
                .collect(),
        }
    }
}

impl StaticRates {
    /// Override or add one rate, in units per US dollar.
    pub fn with_rate(mut self, code: &str, per_usd: f64) -> Self {
        self.per_usd.insert(code.to_uppercase(), per_usd);
        self
    }

    fn rate(&self, code: &str) -> Result<f64, AppError> {
        self.per_usd
            .get(&code.to_uppercase())
            .copied()
            .filter(|r| *r > 0.0)
            .ok_or_else(|| AppError::Generic(format!("unknown currency: {code}")))
    }

    /// Convert the listing's price to USD in place.
    pub fn normalize_to_usd(&self, property: &mut Property) -> Result<(), AppError> {
        if property.currency.is_empty() || property.currency.eq_ignore_ascii_case("USD") {
            property.currency = "USD".to_string();
            return Ok(());
        }
        property.price = self.convert(property.price, &property.currency, "USD")?;
        property.currency = "USD".to_string();
        Ok(())
    }
}

impl CurrencyConverter for StaticRates {
    fn convert(&self, amount: f64, from: &str, to: &str) -> Result<f64, AppError> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(amount);
        }
        let usd = amount / self.rate(from)?;
        Ok(usd * self.rate(to)?)
    }
}

/// Local currency of the countries the bundled sources cover.
pub fn currency_for_country(country: &str) -> Option<&'static str> {
    let code = match country.trim().to_lowercase().as_str() {
        "united states" | "usa" | "us" => "USD",
        "united kingdom" | "uk" | "gb" => "GBP",
        "germany" | "france" | "spain" | "italy" | "netherlands" | "portugal" => "EUR",
        "russia" => "RUB",
        "japan" => "JPY",
        "australia" => "AUD",
        "canada" => "CAD",
        "china" => "CNY",
        "switzerland" => "CHF",
        "india" => "INR",
        _ => return None,
    };
    Some(code)
}
