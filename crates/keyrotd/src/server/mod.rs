//! Node HTTP API: routing, handlers, shared state, and the TLS listener.
//!
//! # Responsibilities
//! - Expose this node's state to peers and its cluster report to operators.
//! - Accept stage transitions and reloads.
//! - Serve over plain HTTP or, when a certificate is configured, rustls.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
pub mod tls;
