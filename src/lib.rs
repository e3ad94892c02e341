//! Aggregates football data from several unreliable providers into one
//! merged, cached view, with a small SQLite store for manual records.

pub mod aggregator;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod entity;
pub mod error;
pub mod http_client;
pub mod leagues;
pub mod logging;
pub mod merge;
pub mod pool;
pub mod rate_limit;
pub mod sources;
pub mod store;

pub use aggregator::{Aggregated, Aggregator, Freshness};
pub use config::HubConfig;
pub use error::{HubError, Result};
