pub mod proxy_registry;
pub mod transport;
pub mod venue;

pub use proxy_registry::{Proxy, ProxyRegistry, ProxyStats, ProxyUsage};
pub use transport::{HttpResponse, HttpTransport, StreamSession, Transport};
pub use venue::{parse_push, subscribe_request, PolledQuote, StreamQuote, VenueClient};
