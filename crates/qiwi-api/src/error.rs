//! Error types for wallet API calls

/// Errors from wallet API operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wrapped object is not a usable authenticated session.
    #[error("invalid auth session: {0}")]
    InvalidSession(String),

    /// Failure propagated from the session transport.
    #[error(transparent)]
    Auth(#[from] qiwi_auth::Error),
}

/// Result alias for wallet API operations.
pub type Result<T> = std::result::Result<T, Error>;
