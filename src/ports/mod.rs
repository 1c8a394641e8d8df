pub mod codec;
pub mod interceptor;
pub mod transport;

pub use codec::{BodySink, BodySource, ExchangeCodec, ResponseHead};
pub use interceptor::Interceptor;
pub use transport::{BoxedTransport, Connector, Dns, Transport};
