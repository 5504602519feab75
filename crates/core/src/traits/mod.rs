pub mod codec;
pub mod listener;
pub mod network;
pub mod storage;

pub use codec::*;
pub use listener::TransportListener;
pub use network::*;
pub use storage::KeyValueStore;
