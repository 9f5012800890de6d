//! Backend HTTP/2 session core.
//!
//! Each proxy worker owns one long-lived, multiplexed client-side HTTP/2
//! connection toward the origin server, optionally established through an
//! HTTP CONNECT tunnel and/or TLS with ALPN. This crate is that session:
//! the evented connection lifecycle, the protocol callback surface, and
//! the bookkeeping tying HTTP/2 streams to proxy-level downstream
//! connections.
//!
//! The client-facing side of the proxy is out of scope here; it plugs in
//! through the [`upstream::Upstream`] capability trait.

pub mod buffer;
pub mod config;
pub mod downstream;
pub mod logging;
pub mod metrics;
pub mod reactor;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod upstream;
pub mod worker;

pub use config::Config;
pub use downstream::{Downstream, ResponseState};
pub use reactor::{Event, Reactor, TimerId};
pub use session::{DconnId, Http2Session, SessionState};
pub use upstream::Upstream;
pub use worker::Worker;
