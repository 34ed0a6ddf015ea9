//! HTML listing sites, scraped with CSS selectors.
//!
//! One search page is fetched per city and category. A page that fails is
//! skipped so the remaining combinations still get harvested.

use std::fmt;

use async_trait::async_trait;
use hearth_core::error::AppError;
use hearth_core::models::{Property, derive_external_id};
use hearth_core::source::{ParseFailure, Source, sweep_dimensions};
use hearth_core::traits::Fetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

/// CSS selectors, each evaluated inside one listing card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Matches each listing card on the search page.
    pub card: String,
    pub link: String,
    pub price: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    /// Card attribute holding the listing id. Falls back to the link.
    #[serde(default)]
    pub id_attr: Option<String>,
    #[serde(default = "default_lat_attr")]
    pub lat_attr: String,
    #[serde(default = "default_lng_attr")]
    pub lng_attr: String,
}

fn default_lat_attr() -> String {
    "data-lat".to_string()
}

fn default_lng_attr() -> String {
    "data-lng".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSiteConfig {
    pub name: String,
    pub base_url: String,
    /// Path with `{city}` and `{category}` placeholders.
    pub search_path: String,
    pub country: String,
    pub cities: Vec<String>,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub selectors: SelectorConfig,
}

fn default_categories() -> Vec<String> {
    vec!["apartment".to_string()]
}

fn default_currency() -> String {
    "USD".to_string()
}

/// One search page: a city and a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTarget {
    pub city: String,
    pub category: String,
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.city, self.category)
    }
}

struct CompiledSelectors {
    card: Selector,
    link: Selector,
    price: Selector,
    title: Option<Selector>,
    address: Option<Selector>,
    bedrooms: Option<Selector>,
    area: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ConfigError(format!("invalid selector {selector:?}: {e:?}")))
}

fn compile_opt(selector: Option<&String>) -> Result<Option<Selector>, AppError> {
    selector.map(|s| compile(s)).transpose()
}

impl CompiledSelectors {
    fn new(config: &SelectorConfig) -> Result<Self, AppError> {
        Ok(Self {
            card: compile(&config.card)?,
            link: compile(&config.link)?,
            price: compile(&config.price)?,
            title: compile_opt(config.title.as_ref())?,
            address: compile_opt(config.address.as_ref())?,
            bedrooms: compile_opt(config.bedrooms.as_ref())?,
            area: compile_opt(config.area.as_ref())?,
        })
    }
}

pub struct ListingSiteSource<F> {
    config: ListingSiteConfig,
    base: Url,
    selectors: CompiledSelectors,
    fetcher: F,
}

impl<F: Fetcher> ListingSiteSource<F> {
    /// Fails on a malformed base URL or selector.
    pub fn new(config: ListingSiteConfig, fetcher: F) -> Result<Self, AppError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| AppError::ConfigError(format!("invalid base URL {}: {e}", config.base_url)))?;
        let selectors = CompiledSelectors::new(&config.selectors)?;
        Ok(Self {
            config,
            base,
            selectors,
            fetcher,
        })
    }

    pub fn targets(&self) -> Vec<SearchTarget> {
        self.config
            .cities
            .iter()
            .flat_map(|city| {
                self.config.categories.iter().map(|category| SearchTarget {
                    city: city.clone(),
                    category: category.clone(),
                })
            })
            .collect()
    }

    fn search_url(&self, target: &SearchTarget) -> Result<Url, AppError> {
        let path = self
            .config
            .search_path
            .replace("{city}", &slug(&target.city))
            .replace("{category}", &slug(&target.category));
        self.base
            .join(&path)
            .map_err(|e| AppError::ConfigError(format!("invalid search path {path}: {e}")))
    }

    async fn parse_target(
        &self,
        cancel: &CancellationToken,
        target: SearchTarget,
    ) -> Result<Vec<Property>, AppError> {
        let url = self.search_url(&target)?;
        let body = self.fetcher.fetch(cancel, url.as_str()).await?;
        Ok(self.extract(&body, &url, &target))
    }

    /// Cards without a link or price are skipped.
    fn extract(&self, body: &str, page: &Url, target: &SearchTarget) -> Vec<Property> {
        let document = Html::parse_document(body);
        document
            .select(&self.selectors.card)
            .filter_map(|card| self.card_to_property(card, page, target))
            .collect()
    }

    fn card_to_property(
        &self,
        card: ElementRef<'_>,
        page: &Url,
        target: &SearchTarget,
    ) -> Option<Property> {
        let sel = &self.selectors;
        let cfg = &self.config.selectors;

        let href = card
            .select(&sel.link)
            .next()
            .and_then(|a| a.value().attr("href"))?;
        let link = page.join(href).ok()?;

        let price = first_text(card, Some(&sel.price)).and_then(|t| parse_amount(&t))?;
        let title = first_text(card, sel.title.as_ref()).unwrap_or_default();
        let address = first_text(card, sel.address.as_ref()).unwrap_or_default();

        let external_id = cfg
            .id_attr
            .as_deref()
            .and_then(|attr| card.value().attr(attr))
            .map(str::to_string)
            .or_else(|| id_from_link(&link))
            .unwrap_or_else(|| {
                let price_label = price.to_string();
                derive_external_id(&[title.as_str(), address.as_str(), price_label.as_str()])
            });

        let mut property = Property::new(self.config.name.clone(), external_id);
        property.url = link.to_string();
        property.country = self.config.country.clone();
        property.city = target.city.clone();
        property.property_type = target.category.clone();
        property.address = address;
        property.description = title;
        property.price = price;
        property.currency = self.config.currency.clone();
        property.bedrooms = first_text(card, sel.bedrooms.as_ref())
            .and_then(|t| first_number(&t))
            .map_or(0, |n| n as i32);
        property.area = first_text(card, sel.area.as_ref())
            .and_then(|t| first_number(&t))
            .unwrap_or_default();
        property.latitude = attr_number(card, &cfg.lat_attr).unwrap_or_default();
        property.longitude = attr_number(card, &cfg.lng_attr).unwrap_or_default();

        Some(property)
    }
}

#[async_trait]
impl<F: Fetcher + 'static> Source for ListingSiteSource<F> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn parse(&self, cancel: &CancellationToken) -> Result<Vec<Property>, ParseFailure> {
        let targets = self.targets();
        let records = sweep_dimensions(&self.config.name, cancel, &targets, |target| {
            self.parse_target(cancel, target)
        })
        .await?;
        tracing::info!(source = %self.config.name, count = records.len(), "Parsed listing site");
        Ok(records)
    }
}

fn first_text(card: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let element = card.select(selector?).next()?;
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn attr_number(card: ElementRef<'_>, attr: &str) -> Option<f64> {
    card.value().attr(attr)?.trim().parse().ok()
}

/// Digits of a price label like `$1,250,000 / month`.
fn parse_amount(text: &str) -> Option<f64> {
    let digits: String = text
        .split('/')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok().filter(|p: &f64| *p > 0.0)
}

/// First decimal number in a label like `3 bd` or `85.5 m²`.
fn first_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}

/// Last non-empty path segment, e.g. `/homedetails/12345/` gives `12345`.
fn id_from_link(link: &Url) -> Option<String> {
    link.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

fn slug(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
