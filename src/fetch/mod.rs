pub mod circuit;
pub mod client;
pub mod http;
pub mod source;

pub use circuit::{BreakerSnapshot, CircuitBreaker};
pub use client::ResilientClient;
pub use http::HttpSource;
pub use source::{PayloadSource, ScheduleSource};
