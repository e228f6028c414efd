//! QIWI wallet web authentication
//!
//! Phone/password credential exchange against the wallet's OAuth-style token
//! endpoint, with captcha-gated retry, a background task that refreshes the
//! session strictly before expiry, and derivation of the `TokenHeadV2`
//! API token header every subsequent request carries. This crate is a
//! standalone library; the endpoint surface lives in `qiwi-api`.
//!
//! Session flow:
//! 1. Caller builds an [`AuthSession`], optionally routed through a proxy
//! 2. [`AuthSession::authenticate`] runs the anonymous and password grants
//! 3. The first success installs the token state and spawns the refresh task
//! 4. Requests go out with the derived `Authorization` header, swapped
//!    atomically on every refresh
//! 5. [`AuthSession::close`] stops the task and fails all further requests

pub mod constants;
pub mod cookies;
pub mod error;
pub mod proxy;
mod refresh;
mod secret;
pub mod session;
pub mod token;

pub use cookies::SessionCookie;
pub use error::{Error, Result};
pub use proxy::{ProxyConfig, ProxyKind, build_client};
pub use secret::Secret;
pub use session::{AuthSession, AuthSessionBuilder, TokenState};
pub use token::TokenResponse;
