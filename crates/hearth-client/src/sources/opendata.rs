//! Government open-data portals publishing sales or listings as JSON or CSV.
//!
//! Portals disagree on field names, units and whether they publish an id at
//! all, so one configurable source covers them: a [`FieldMap`] names the
//! columns, `area_factor` converts units, and `id_from` derives a stable id
//! for registries keyed by address and date.

use async_trait::async_trait;
use hearth_core::error::AppError;
use hearth_core::models::{Property, derive_external_id};
use hearth_core::source::{ParseFailure, Source, retain_valid};
use hearth_core::traits::{Fetcher, Geocoder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::currency::{StaticRates, currency_for_country};
use crate::geocoding::NoGeocoder;

/// Square feet to square meters.
pub const SQFT_TO_SQM: f64 = 0.092903;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    Csv,
}

/// Column names in the portal's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub id: String,
    pub address: String,
    pub district: String,
    pub price: String,
    pub latitude: String,
    pub longitude: String,
    pub area: String,
    pub rooms: String,
    pub bedrooms: String,
    pub bathrooms: String,
    pub year_built: String,
    pub property_type: String,
    pub description: String,
    pub url: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id: "id".into(),
            address: "address".into(),
            district: "district".into(),
            price: "price".into(),
            latitude: "latitude".into(),
            longitude: "longitude".into(),
            area: "area".into(),
            rooms: "rooms".into(),
            bedrooms: "bedrooms".into(),
            bathrooms: "bathrooms".into(),
            year_built: "year_built".into(),
            property_type: "type".into(),
            description: "description".into(),
            url: "url".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenDataConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: DataFormat,
    /// Dotted path to the record array inside a JSON payload
    /// (`"results"`, `"data.items"`). The root when absent.
    #[serde(default)]
    pub results_path: Option<String>,
    pub country: String,
    pub city: String,
    /// Currency of the published prices. Derived from `country` when absent.
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    /// Columns whose values are hashed into the external id, for portals
    /// without a record id.
    #[serde(default)]
    pub id_from: Vec<String>,
    /// Multiplier turning the published area into square meters.
    #[serde(default = "default_area_factor")]
    pub area_factor: f64,
    #[serde(default = "default_property_type")]
    pub default_property_type: String,
    /// Convert prices to USD before emitting.
    #[serde(default)]
    pub to_usd: bool,
}

fn default_area_factor() -> f64 {
    1.0
}

fn default_property_type() -> String {
    "apartment".to_string()
}

impl OpenDataConfig {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        country: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format: DataFormat::Json,
            results_path: None,
            country: country.into(),
            city: city.into(),
            currency: None,
            fields: FieldMap::default(),
            id_from: Vec::new(),
            area_factor: default_area_factor(),
            default_property_type: default_property_type(),
            to_usd: false,
        }
    }

    fn currency(&self) -> String {
        self.currency
            .clone()
            .or_else(|| currency_for_country(&self.country).map(str::to_string))
            .unwrap_or_else(|| "USD".to_string())
    }
}

type Row = Map<String, Value>;

pub struct OpenDataSource<F, G = NoGeocoder> {
    config: OpenDataConfig,
    fetcher: F,
    geocoder: Option<G>,
    rates: StaticRates,
}

impl<F: Fetcher> OpenDataSource<F, NoGeocoder> {
    pub fn new(config: OpenDataConfig, fetcher: F) -> Self {
        Self {
            config,
            fetcher,
            geocoder: None,
            rates: StaticRates::default(),
        }
    }
}

impl<F: Fetcher, G: Geocoder> OpenDataSource<F, G> {
    /// Resolve addresses of records published without coordinates.
    pub fn with_geocoder<G2: Geocoder>(self, geocoder: G2) -> OpenDataSource<F, G2> {
        OpenDataSource {
            config: self.config,
            fetcher: self.fetcher,
            geocoder: Some(geocoder),
            rates: self.rates,
        }
    }

    pub fn with_rates(mut self, rates: StaticRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn config(&self) -> &OpenDataConfig {
        &self.config
    }

    fn rows(&self, body: &str) -> Result<Vec<Row>, AppError> {
        match self.config.format {
            DataFormat::Json => json_rows(body, self.config.results_path.as_deref()),
            DataFormat::Csv => csv_rows(body),
        }
    }

    /// Map one row onto a listing. `None` when it carries no positive price.
    fn to_property(&self, row: &Row) -> Option<Property> {
        let fields = &self.config.fields;

        let price = number(row, &fields.price).filter(|p| *p > 0.0)?;

        let external_id = if self.config.id_from.is_empty() {
            text(row, &fields.id)
        } else {
            let parts: Vec<String> = self.config.id_from.iter().map(|f| text(row, f)).collect();
            let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
            derive_external_id(&parts)
        };

        let mut property = Property::new(self.config.name.clone(), external_id);
        property.url = text(row, &fields.url);
        property.country = self.config.country.clone();
        property.city = self.config.city.clone();
        property.district = text(row, &fields.district);
        property.address = text(row, &fields.address);
        property.latitude = number(row, &fields.latitude).unwrap_or_default();
        property.longitude = number(row, &fields.longitude).unwrap_or_default();
        property.price = price;
        property.currency = self.config.currency();
        property.area = number(row, &fields.area).unwrap_or_default() * self.config.area_factor;
        property.rooms = integer(row, &fields.rooms);
        property.bedrooms = integer(row, &fields.bedrooms);
        property.bathrooms = integer(row, &fields.bathrooms);
        property.year_built = integer(row, &fields.year_built);
        property.description = text(row, &fields.description);

        let property_type = text(row, &fields.property_type);
        property.property_type = if property_type.is_empty() {
            self.config.default_property_type.clone()
        } else {
            property_type
        };

        Some(property)
    }

    async fn locate(&self, property: &mut Property) {
        let Some(geocoder) = &self.geocoder else {
            return;
        };
        if property.has_coordinates() || property.address.is_empty() {
            return;
        }

        let query = format!("{}, {}", property.address, property.city);
        match geocoder.geocode(&query).await {
            Ok((lat, lng)) => {
                property.latitude = lat;
                property.longitude = lng;
            }
            Err(e) => {
                tracing::debug!(source = %self.config.name, address = %query, error = %e, "Geocoding failed");
            }
        }
    }
}

#[async_trait]
impl<F, G> Source for OpenDataSource<F, G>
where
    F: Fetcher + 'static,
    G: Geocoder + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn parse(&self, cancel: &CancellationToken) -> Result<Vec<Property>, ParseFailure> {
        let body = self.fetcher.fetch(cancel, &self.config.url).await?;
        let rows = self.rows(&body)?;
        tracing::debug!(source = %self.config.name, rows = rows.len(), "Decoded payload");

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if cancel.is_cancelled() {
                let gathered = retain_valid(&self.config.name, records);
                return Err(ParseFailure::new(gathered, AppError::Cancelled));
            }

            let Some(mut property) = self.to_property(row) else {
                continue;
            };
            self.locate(&mut property).await;

            if self.config.to_usd
                && let Err(e) = self.rates.normalize_to_usd(&mut property)
            {
                tracing::warn!(source = %self.config.name, error = %e, "Keeping original currency");
            }
            records.push(property);
        }

        let records = retain_valid(&self.config.name, records);
        tracing::info!(source = %self.config.name, count = records.len(), "Parsed open data");
        Ok(records)
    }
}

fn json_rows(body: &str, results_path: Option<&str>) -> Result<Vec<Row>, AppError> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| AppError::ParseError(format!("invalid JSON payload: {e}")))?;

    let mut node = &root;
    for key in results_path.into_iter().flat_map(|p| p.split('.')) {
        node = node
            .get(key)
            .ok_or_else(|| AppError::ParseError(format!("missing key {key:?} in payload")))?;
    }

    let items = node
        .as_array()
        .ok_or_else(|| AppError::ParseError("expected an array of records".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| item.as_object().cloned())
        .collect())
}

fn csv_rows(body: &str) -> Result<Vec<Row>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| AppError::ParseError(format!("invalid CSV header: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| AppError::ParseError(format!("invalid CSV row: {e}")))?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn text(row: &Row, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Numbers arrive as JSON numbers or as strings like `"$1,250,000"`.
fn number(row: &Row, field: &str) -> Option<f64> {
    match row.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

fn integer(row: &Row, field: &str) -> i32 {
    number(row, field).map_or(0, |n| n.trunc() as i32)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use hearth_core::testutil::MockFetcher;

    use super::*;

    const NYC_SALES: &str = r#"[
        {"address": "10 Hudson St", "neighborhood": "TRIBECA", "sale_price": "1,250,000",
         "sale_date": "2024-01-05", "gross_square_feet": "1000", "year_built": "1910",
         "residential_units": "2", "latitude": "40.7168", "longitude": "-74.0086"},
        {"address": "22 Reade St", "neighborhood": "CIVIC CENTER", "sale_price": "0",
         "sale_date": "2024-01-06"},
        {"address": "5 Beach St", "neighborhood": "TRIBECA", "sale_price": "980000",
         "sale_date": "2024-02-11", "gross_square_feet": "", "year_built": ""}
    ]"#;

    fn nyc_config() -> OpenDataConfig {
        let mut config = OpenDataConfig::new(
            "nyc_opendata",
            "https://data.example.gov/resource/sales.json",
            "United States",
            "New York",
        );
        config.fields.price = "sale_price".into();
        config.fields.district = "neighborhood".into();
        config.fields.area = "gross_square_feet".into();
        config.fields.rooms = "residential_units".into();
        config.id_from = vec!["address".into(), "sale_date".into()];
        config.area_factor = SQFT_TO_SQM;
        config
    }

    #[derive(Clone, Default)]
    struct StubGeocoder {
        queries: Arc<Mutex<Vec<String>>>,
    }

    impl Geocoder for StubGeocoder {
        async fn geocode(&self, address: &str) -> Result<(f64, f64), AppError> {
            self.queries.lock().unwrap().push(address.to_string());
            if address.starts_with("5 Beach") {
                Ok((40.7197, -74.0079))
            } else {
                Err(AppError::ParseError("not found".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_sales_registry_maps_fields_and_derives_ids() {
        let fetcher = MockFetcher::new().route("sales.json", NYC_SALES);
        let source = OpenDataSource::new(nyc_config(), fetcher);

        let records = source.parse(&CancellationToken::new()).await.unwrap();

        // The zero-priced sale is dropped.
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.source, "nyc_opendata");
        assert_eq!(
            first.external_id,
            derive_external_id(&["10 Hudson St", "2024-01-05"])
        );
        assert_eq!(first.price, 1_250_000.0);
        assert_eq!(first.currency, "USD");
        assert_eq!(first.district, "TRIBECA");
        assert_eq!(first.rooms, 2);
        assert_eq!(first.year_built, 1910);
        assert!((first.area - 92.903).abs() < 1e-6);
        assert_eq!((first.latitude, first.longitude), (40.7168, -74.0086));
        assert_eq!(first.property_type, "apartment");

        // No coordinates and no geocoder: still valid thanks to the address.
        assert!(!records[1].has_coordinates());
    }

    #[tokio::test]
    async fn test_missing_coordinates_are_geocoded() {
        let geocoder = StubGeocoder::default();
        let fetcher = MockFetcher::new().route("sales.json", NYC_SALES);
        let source = OpenDataSource::new(nyc_config(), fetcher).with_geocoder(geocoder.clone());

        let records = source.parse(&CancellationToken::new()).await.unwrap();

        assert_eq!((records[1].latitude, records[1].longitude), (40.7197, -74.0079));
        // Only the record without coordinates is looked up.
        assert_eq!(
            *geocoder.queries.lock().unwrap(),
            vec!["5 Beach St, New York".to_string()]
        );
    }

    #[tokio::test]
    async fn test_nested_results_and_numeric_values() {
        let body = r#"{"data": {"items": [
            {"id": 7, "address": "Unter den Linden 1", "price": 450000.5, "rooms": 3,
             "type": "Flat", "latitude": 52.517, "longitude": 13.389},
            {"id": 8, "price": 300000}
        ]}}"#;
        let mut config = OpenDataConfig::new(
            "berlin_opendata",
            "https://daten.example.de/api",
            "Germany",
            "Berlin",
        );
        config.results_path = Some("data.items".into());
        let source = OpenDataSource::new(config, MockFetcher::new().route("daten", body));

        let records = source.parse(&CancellationToken::new()).await.unwrap();

        // Record 8 has neither coordinates nor an address.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "7");
        assert_eq!(records[0].currency, "EUR");
        assert_eq!(records[0].property_type, "Flat");
        assert_eq!(records[0].rooms, 3);
    }

    #[tokio::test]
    async fn test_csv_payload() {
        let body = "ref,street,amount,lat,lon\n\
                    A1, 1 High St ,\"£325,000\",51.5,-0.12\n\
                    A2,2 High St,,51.5,-0.13\n";
        let mut config = OpenDataConfig::new(
            "london_opendata",
            "https://data.example.uk/prices.csv",
            "United Kingdom",
            "London",
        );
        config.format = DataFormat::Csv;
        config.fields.id = "ref".into();
        config.fields.address = "street".into();
        config.fields.price = "amount".into();
        config.fields.latitude = "lat".into();
        config.fields.longitude = "lon".into();
        config.to_usd = true;

        let source = OpenDataSource::new(config, MockFetcher::new().route("prices.csv", body))
            .with_rates(StaticRates::default().with_rate("GBP", 0.5));
        let records = source.parse(&CancellationToken::new()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "A1");
        assert_eq!(records[0].address, "1 High St");
        assert_eq!(records[0].currency, "USD");
        assert!((records[0].price - 650_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_parse_failure() {
        let source = OpenDataSource::new(nyc_config(), MockFetcher::new().fail("sales", 404));
        let err = source.parse(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.error, AppError::HttpStatus { status: 404, .. }));
        assert!(err.gathered.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_parse_error() {
        let source =
            OpenDataSource::new(nyc_config(), MockFetcher::new().route("sales", "{not json"));
        let err = source.parse(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.error, AppError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = OpenDataSource::new(nyc_config(), MockFetcher::new().route("sales", NYC_SALES));

        let err = source.parse(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: OpenDataConfig = serde_json::from_str(
            r#"{"name": "paris", "url": "https://x", "country": "France", "city": "Paris",
                "fields": {"price": "valeur_fonciere"}}"#,
        )
        .unwrap();
        assert_eq!(config.format, DataFormat::Json);
        assert_eq!(config.fields.price, "valeur_fonciere");
        assert_eq!(config.fields.address, "address");
        assert_eq!(config.area_factor, 1.0);
        assert_eq!(config.currency(), "EUR");
    }
}
