pub mod address;
pub mod profile;
pub mod status;
pub mod task;

pub use address::*;
pub use profile::*;
pub use status::*;
pub use task::*;
