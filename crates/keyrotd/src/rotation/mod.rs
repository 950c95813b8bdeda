//! Stage transitions of the key-rotation protocol.
//!
//! ```text
//! start ─prepare→ prepare ─rotate→ rotate ─reencrypt→ reencrypt_active → reencrypt_finished
//!   ▲                                                                          │
//!   └──────────────────────────── next cycle (prepare) ────────────────────────┘
//! ```
//!
//! Each node runs its own [`RotationController`]. Nodes never talk to each
//! other here: a transition is saved to the local file and published as a
//! generation marker, and peers adopt it on their next reload.

pub mod controller;

pub use controller::{ReencryptOptions, RotationController};
