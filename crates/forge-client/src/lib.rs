//! The client-side runtime core: endpoint and auth-scheme resolution,
//! the interceptor chain, the invocation pipeline, the waiter engine, and
//! the async paginator (components C8–C11 plus their §6.2/§6.3 external
//! collaborators).
//!
//! Each concern gets its own module, the layout `flow-client` uses for its
//! own request/response/retry split rather than one flat file.

pub mod auth;
pub mod endpoint;
pub mod interceptor;
pub mod paginator;
pub mod pipeline;
pub mod pool;
pub mod transport;
pub mod waiter;

pub use auth::{AuthSchemeId, AuthSchemeOption, AuthSchemeResolver, RegisteredAuthScheme, StaticAuthSchemeResolver};
pub use endpoint::{Endpoint, EndpointParams, EndpointResolver, StaticEndpointResolver};
pub use interceptor::{Interceptor, InterceptorChain, InterceptorContext};
pub use paginator::{Page, PageFetcher, Paginator};
pub use pool::ConnectionPool;
pub use pipeline::{ClientPipeline, FnCodec, IdempotencyTokenProvider, RequestSerializer, ResponseDeserializer};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use waiter::{wait, FnAcceptor, WaiterAcceptor, WaiterAcceptorResult, WaiterConfig};
