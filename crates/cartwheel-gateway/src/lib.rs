//! Cartwheel's client-facing edge.
//!
//! One WebSocket connection carries one session. The connection module owns
//! the socket lifecycle (auth, idle timeout, read/write split); the session
//! module owns the driver task that applies inbound frames to the agent
//! runtime in arrival order; the egress module turns node output into paced
//! wire frames. Rate limiting sits at two points: a per-principal token
//! bucket at ingress and a priority-ordered gate on outbound LLM calls.

pub mod auth;
pub mod connection;
pub mod egress;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod state;

pub use auth::{auth_from_config, HttpTokenAuth};
pub use egress::EgressStream;
pub use rate_limit::{GatedProvider, Priority, RateLimiter};
pub use server::start_gateway;
pub use session::SessionManager;
pub use state::GatewayState;
