//! Flood protection and link quality estimation.

pub mod adaptive_timeout;
pub mod anti_avalanche;
pub mod flow_limit;
pub mod frequency_limit;

pub use adaptive_timeout::{AdaptiveTimeout, TimeoutStatus, FAILED_PKG_LEN};
pub use anti_avalanche::{FloodControl, FloodRejection};
pub use flow_limit::FlowLimit;
pub use frequency_limit::FrequencyLimit;
