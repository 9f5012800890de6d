//! Session metrics.

use metriken::{Counter, Gauge, metric};

/// Sessions currently in the CONNECTED state.
#[metric(name = "proxy_sessions_connected")]
pub static SESSIONS_CONNECTED: Gauge = Gauge::new();

/// Requests submitted to the backend session.
#[metric(name = "proxy_backend_requests")]
pub static BACKEND_REQUESTS: Counter = Counter::new();

/// Responses that reached MSG_COMPLETE.
#[metric(name = "proxy_backend_responses")]
pub static BACKEND_RESPONSES: Counter = Counter::new();

/// Streams reset locally or by the peer.
#[metric(name = "proxy_streams_reset")]
pub static STREAMS_RESET: Counter = Counter::new();

/// PING-based connection health probes started.
#[metric(name = "proxy_health_checks")]
pub static HEALTH_CHECKS: Counter = Counter::new();

/// Session disconnects (all causes).
#[metric(name = "proxy_session_disconnects")]
pub static SESSION_DISCONNECTS: Counter = Counter::new();
