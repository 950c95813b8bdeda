//! Common types, protocol definitions, and errors shared across `keyrot` crates.

pub mod error;
pub mod protocol;

pub use error::EncryptionError;
pub use protocol::Stage;
