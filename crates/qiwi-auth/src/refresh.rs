//! Background token refresh task
//!
//! One task per session keeps the installed token fresh: sleep for the
//! margin-adjusted expiry, then run a refresh grant under the session's
//! refresh lock and go back to sleep on the new interval. `close()` flips
//! the shutdown watch, which interrupts any pending sleep instead of leaving
//! the task dangling on a closed session.
//!
//! Failure policy: a server-side rejection of the refresh grant marks the
//! session stale and ends the loop; the caller must authenticate again.
//! Anything else (transport failure, unexpected status) is treated as
//! transient and retried after a fixed delay without touching the installed
//! token.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::constants::REFRESH_RETRY_DELAY_SECS;
use crate::error::Error;
use crate::session::AuthSession;

/// Spawn the refresh loop for a freshly authenticated session.
///
/// The task holds only a `Weak` reference: it never keeps a dropped session
/// alive, and exits on its own if the session goes away without `close()`.
/// Returns the `JoinHandle` the session awaits on `close()`.
pub(crate) fn spawn_refresh_task(
    session: Weak<AuthSession>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        'run: loop {
            let delay = {
                let Some(session) = session.upgrade() else {
                    break;
                };
                match session.refresh_after().await {
                    Some(delay) => delay,
                    None => {
                        warn!("refresh task found no installed token, stopping");
                        break;
                    }
                }
            };
            debug!(delay_secs = delay.as_secs(), "next token refresh scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break 'run,
            }

            loop {
                let Some(session) = session.upgrade() else {
                    break 'run;
                };
                match session.refresh_once().await {
                    Ok(()) => {
                        debug!("background token refresh succeeded");
                        break;
                    }
                    Err(e @ (Error::AuthenticationFailed(_) | Error::RecaptchaRequired)) => {
                        warn!(error = %e, "refresh grant rejected, session needs re-authentication");
                        session.mark_stale();
                        break 'run;
                    }
                    Err(Error::SessionClosed) => break 'run,
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_secs = REFRESH_RETRY_DELAY_SECS,
                            "token refresh failed, retrying"
                        );
                        drop(session);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(REFRESH_RETRY_DELAY_SECS)) => {}
                            _ = shutdown.changed() => break 'run,
                        }
                    }
                }
            }
        }
        debug!("refresh task stopped");
    })
}
