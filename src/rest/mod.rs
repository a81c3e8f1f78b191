//! REST side: route-keyed rate limiting over a pluggable HTTP transport.

mod dispatcher;
mod gateway;
mod global;
pub mod latency;
mod request;
pub mod route;
mod transport;

pub use dispatcher::Dispatcher;
pub use gateway::{GatewayBot, SessionStartLimit};
pub use global::GlobalGate;
pub use latency::LatencyRef;
pub use request::{FileUpload, RestRequest};
pub use transport::{HttpBody, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
