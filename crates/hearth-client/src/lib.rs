pub mod currency;
pub mod geocoding;
pub mod proxy_check;
pub mod registry;
pub mod sources;
pub mod tor;
pub mod transport;

pub use currency::{StaticRates, currency_for_country};
pub use geocoding::{CachedGeocoder, GeocoderConfig, HttpGeocoder, NoGeocoder, Provider};
pub use proxy_check::{ProxyCheckConfig, ProxyCheckSummary, check_proxies};
pub use registry::{
    FetcherFactory, Routing, SourceFetcher, SourceSpec, build_sources, load_sources, parse_sources,
};
pub use sources::{ListingSiteSource, OpenDataSource};
pub use tor::{TorConfig, TorController};
pub use transport::{AnyTransport, PooledTransport, ReqwestTransport, Selection};
