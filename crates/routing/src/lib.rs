//! Endpoint selection for both link types.
//!
//! [`NetworkConfig`] owns the configured hosts and overrides, [`AddressHealthTracker`]
//! remembers how each `(ip, port)` behaved and [`AddressSource`] turns host names into
//! ranked candidate lists.

pub mod health;
pub mod network_config;
pub mod source;

pub use health::{ban_duration, AddressHealthTracker};
pub use network_config::NetworkConfig;
pub use source::{AddressSource, MAX_CANDIDATES};
