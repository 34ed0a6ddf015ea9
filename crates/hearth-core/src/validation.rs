//! Canonical-record validation and normalization.
//!
//! Sources call [`validate_property`] to drop records that lack a mandatory
//! field; the orchestrator runs both functions once more before persisting.

use crate::error::AppError;
use crate::models::Property;

/// Check the fields every stored listing must carry.
pub fn validate_property(property: &Property) -> Result<(), AppError> {
    if property.price.is_nan() || property.price <= 0.0 {
        return Err(AppError::Validation {
            field: "price",
            message: "price must be greater than 0",
        });
    }

    if !property.has_coordinates() && property.address.trim().is_empty() {
        return Err(AppError::Validation {
            field: "location",
            message: "latitude/longitude or address required",
        });
    }

    if property.source.is_empty() {
        return Err(AppError::Validation {
            field: "source",
            message: "source is required",
        });
    }

    if property.external_id.is_empty() {
        return Err(AppError::Validation {
            field: "external_id",
            message: "external_id is required",
        });
    }

    Ok(())
}

/// Normalize free-text fields in place.
pub fn normalize_property(property: &mut Property) {
    property.city = collapse_whitespace(&property.city);
    property.country = collapse_whitespace(&property.country);
    property.district = collapse_whitespace(&property.district);
    property.address = collapse_whitespace(&property.address);

    if !property.property_type.is_empty() {
        property.property_type = normalize_type(&property.property_type);
    }

    if property.currency.is_empty() {
        property.currency = "USD".to_string();
    } else {
        property.currency = property.currency.trim().to_uppercase();
    }
}

/// Map the many ways listings spell a property type onto a small vocabulary.
pub fn normalize_type(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "flat" | "apartment" | "apt" | "condo" => "apartment".to_string(),
        "house" | "home" | "villa" | "detached" => "house".to_string(),
        "room" | "bedroom" => "room".to_string(),
        _ if lower.contains("apartment") || lower.contains("flat") => "apartment".to_string(),
        _ if lower.contains("house") => "house".to_string(),
        _ => lower,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
