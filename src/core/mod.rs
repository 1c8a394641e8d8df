pub mod allocator;
pub mod body;
pub mod call;
pub mod chain;
pub mod client;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod pool;
pub mod request;
pub mod response;
pub mod route;
pub mod stages;
pub mod url;

pub use allocator::{ConnectionAllocator, DiscardPolicy, EvictReason};
pub use body::{BytesBody, FormBody, RequestBody, ResponseBody};
pub use call::{Call, CallState};
pub use chain::{Chain, StageKind, Timeouts};
pub use client::{HttpClient, HttpClientBuilder};
pub use connection::{ConnectionId, RealConnection};
pub use error::{ConnectFailure, HttpError, HttpResult, TimeoutPhase};
pub use headers::Headers;
pub use pool::{ConnectionPool, Lease, PoolStats};
pub use request::{Request, RequestBuilder};
pub use response::{Protocol, Response, ResponseBuilder};
pub use route::{Address, Proxy, Route, RouteDatabase, TlsSettings};
pub use url::{HttpUrl, UrlError};
