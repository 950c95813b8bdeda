//! Common error types shared across crates.

use thiserror::Error;

/// Top-level error type for the secrets-encryption subsystem.
///
/// Variants map to HTTP status codes returned by the node API:
/// - [`EncryptionError::ConfigMissing`] → 404
/// - [`EncryptionError::IllegalTransition`] → 409
/// - [`EncryptionError::BadRequest`] → 400
/// - [`EncryptionError::PersistenceFailure`], [`EncryptionError::Unavailable`] → 503
/// - everything else → 500
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// Encryption was never bootstrapped on this node. Treated as "disabled".
    #[error("encryption config missing: {0}")]
    ConfigMissing(String),

    /// The on-disk configuration exists but cannot be parsed or is invalid.
    /// Never silently replaced by a plaintext default.
    #[error("encryption config corrupt: {0}")]
    ConfigCorrupt(String),

    /// The requested transition is not legal from the current stage.
    /// Raised before any state is mutated.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A local save or a datastore write failed; the operation did not happen.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A record could not be decrypted or rewritten; the pass was aborted and
    /// the stage was not advanced.
    #[error("reencryption failure: {0}")]
    ReencryptionFailure(String),

    /// A stored record could not be opened by any key this node holds.
    #[error("record unreadable: {0}")]
    RecordUnreadable(String),

    /// The request was malformed: an unknown stage or invalid JSON.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A peer node could not be reached or timed out.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EncryptionError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            EncryptionError::ConfigMissing(_) => 404,
            EncryptionError::ConfigCorrupt(_) => 500,
            EncryptionError::IllegalTransition(_) => 409,
            EncryptionError::PersistenceFailure(_) => 503,
            EncryptionError::ReencryptionFailure(_) => 500,
            EncryptionError::RecordUnreadable(_) => 500,
            EncryptionError::BadRequest(_) => 400,
            EncryptionError::Unavailable(_) => 503,
        }
    }

    /// Short machine-readable code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EncryptionError::ConfigMissing(_) => "config_missing",
            EncryptionError::ConfigCorrupt(_) => "config_corrupt",
            EncryptionError::IllegalTransition(_) => "illegal_transition",
            EncryptionError::PersistenceFailure(_) => "persistence_failure",
            EncryptionError::ReencryptionFailure(_) => "reencryption_failure",
            EncryptionError::RecordUnreadable(_) => "record_unreadable",
            EncryptionError::BadRequest(_) => "bad_request",
            EncryptionError::Unavailable(_) => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(EncryptionError::ConfigMissing("x".into()).http_status(), 404);
        assert_eq!(EncryptionError::ConfigCorrupt("x".into()).http_status(), 500);
        assert_eq!(
            EncryptionError::IllegalTransition("x".into()).http_status(),
            409
        );
        assert_eq!(
            EncryptionError::PersistenceFailure("x".into()).http_status(),
            503
        );
        assert_eq!(
            EncryptionError::ReencryptionFailure("x".into()).http_status(),
            500
        );
        assert_eq!(EncryptionError::RecordUnreadable("x".into()).http_status(), 500);
        assert_eq!(EncryptionError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(EncryptionError::Unavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn display_includes_message() {
        let e = EncryptionError::IllegalTransition("rotate requested in stage start".into());
        assert!(e.to_string().contains("rotate requested in stage start"));
        assert_eq!(e.code(), "illegal_transition");
    }
}
