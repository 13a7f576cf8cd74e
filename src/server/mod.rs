pub mod http;
pub mod transport;

pub use http::{HttpServer, Request};
pub use transport::ChannelTransport;
