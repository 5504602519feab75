//! # Linkmux Testing Utils
//!
//! In-memory fakes for every collaborator trait of the transport core,
//! plus task builders and async test helpers.
//!
//! ```toml
//! [dev-dependencies]
//! linkmux-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
