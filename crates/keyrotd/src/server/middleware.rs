//! Layer settings applied to the router.
//!
//! Transitions are detached from the request future (see
//! [`super::handlers`]), so the timeout only bounds how long a caller waits,
//! never how far a transition gets.

use std::time::Duration;

/// Per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
