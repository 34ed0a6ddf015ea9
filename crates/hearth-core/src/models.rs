use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A canonical real-estate listing, independent of the format it was
/// harvested from.
///
/// `(source, external_id)` is the natural key: the store keeps exactly one
/// row per pair and updates it in place on later harvests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Store identity. `None` until the record has been persisted.
    pub id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Name of the source that produced the record.
    pub source: String,
    /// Source-local identity of the listing.
    pub external_id: String,
    pub url: String,

    // Location
    pub country: String,
    pub city: String,
    pub district: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,

    // Characteristics
    /// apartment, house, room, ...
    pub property_type: String,
    pub price: f64,
    pub currency: String,
    /// Living area in square meters.
    pub area: f64,
    pub rooms: i32,
    pub bedrooms: i32,
    pub bathrooms: i32,
    pub floor: i32,
    pub total_floors: i32,
    pub year_built: i32,

    pub description: String,
    pub images: Vec<String>,

    pub scraped_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Property {
    /// Start a fresh, active record for `source` scraped right now.
    pub fn new(source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
            scraped_at: Utc::now(),
            is_active: true,
            ..Default::default()
        }
    }

    /// The `(source, external_id)` natural key.
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.source, &self.external_id)
    }

    /// True when the record carries usable coordinates (not the 0,0 null island).
    pub fn has_coordinates(&self) -> bool {
        !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Location-quality factors computed by the enrichment collaborator.
///
/// Scores are 0–100, higher is better.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyFactors {
    pub property_id: i64,
    pub crime_score: f64,
    pub transport_score: f64,
    pub education_score: f64,
    pub infrastructure_score: f64,
    pub overall_score: f64,
    /// Free-form details (stations nearby, school ratings, ...).
    pub details: serde_json::Value,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive a stable external id for sources that publish no identity of their
/// own (e.g. sale registries keyed by address and date).
pub fn derive_external_id(parts: &[&str]) -> String {
    compute_hash(&parts.join("|"))[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_derive_external_id_is_stable_and_order_sensitive() {
        let a = derive_external_id(&["12 Main St", "2024-01-05"]);
        assert_eq!(a, derive_external_id(&["12 Main St", "2024-01-05"]));
        assert_ne!(a, derive_external_id(&["2024-01-05", "12 Main St"]));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_new_property_is_active_and_unsaved() {
        let p = Property::new("nyc_opendata", "abc");
        assert!(p.is_active);
        assert!(p.id.is_none());
        assert_eq!(p.natural_key(), ("nyc_opendata", "abc"));
        assert!(!p.has_coordinates());
    }
}
