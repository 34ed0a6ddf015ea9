pub mod listing_site;
pub mod opendata;

pub use listing_site::{ListingSiteConfig, ListingSiteSource, SearchTarget, SelectorConfig};
pub use opendata::{DataFormat, FieldMap, OpenDataConfig, OpenDataSource, SQFT_TO_SQM};
