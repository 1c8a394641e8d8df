pub mod dns;
pub mod http1_codec;
pub mod tcp_connector;

/// Re-export commonly used types from adapters
pub use dns::SystemDns;
pub use http1_codec::Http1Codec;
pub use tcp_connector::TcpConnector;
