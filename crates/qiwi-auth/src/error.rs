//! Error types for session and token operations

/// Errors from authentication and session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server demands a captcha answer; retry `authenticate` with one.
    #[error("recaptcha required: retry authenticate with a captcha answer")]
    RecaptchaRequired,

    /// Server-reported rejection or an unexpected response shape. Carries
    /// the raw server payload when one was available.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Transport failure, proxy failure, or an unexpected HTTP status.
    #[error("proxy connection failed: {0}")]
    ProxyConnection(String),

    /// Request issued after `close()`.
    #[error("session closed")]
    SessionClosed,
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
