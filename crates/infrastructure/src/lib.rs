//! 传输核心的默认外部实现：TCP 套接字、系统 DNS、文件键值存储、
//! 长链帧编解码、HTTP 短链编解码，以及由宿主应用更新的网络与鉴权状态。

pub mod codec;
pub mod dns;
pub mod http;
pub mod network;
pub mod socket;
pub mod storage;

pub use codec::{DefaultLongLinkProtocol, LengthPrefixedCodec, NoIdentityCheck};
pub use dns::SystemDnsResolver;
pub use http::SimpleHttpCodec;
pub use network::{StaticAuthGate, StaticNetworkInfo};
pub use socket::TokioSocketProvider;
pub use storage::FileKeyValueStore;
