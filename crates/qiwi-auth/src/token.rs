//! Token grants against the wallet's OAuth-style endpoint
//!
//! All three flows hit the same `/oauth/token` endpoint with form-encoded
//! POST bodies and differ only in grant type:
//! 1. `anonymous` (bootstrap token required by the password grant)
//! 2. `password` (phone/password exchange for a full session)
//! 3. `refresh_token` (session renewal without re-submitting the password)
//!
//! The wallet reports rejections as an `error` field in the body (sometimes
//! with a 2xx status line), so classification reads the body before looking
//! at the status. Transport failures, proxy failures and unexpected statuses
//! are folded into one `ProxyConnection` kind, matching what the wallet
//! frontend itself does.

use serde::Deserialize;

use crate::constants::{ANONYMOUS_CLIENT_ID, CLIENT_ID, CLIENT_SECRET, TOKEN_PATH, TOKEN_TYPE};
use crate::cookies::{self, SessionCookie};
use crate::error::{Error, Result};

/// Body shape the wallet returns for an `error` response we did not expect.
const UNKNOWN_AUTH_ERROR: &str = "authorization unknown error";

/// Successful body of the password and refresh grants.
///
/// `expires_in` is a delta in seconds from the response time. The session
/// subtracts the safety margin before scheduling the refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Request the bootstrap anonymous token.
pub async fn anonymous_token(client: &reqwest::Client, base_url: &str) -> Result<String> {
    let response = client
        .post(format!("{base_url}{TOKEN_PATH}"))
        .form(&[
            ("grant_type", "anonymous"),
            ("client_id", ANONYMOUS_CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| Error::ProxyConnection(format!("anonymous grant request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::ProxyConnection(format!("reading anonymous grant response: {e}")))?;

    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|_| unexpected_response(status, &body))?;
    match value.get("access_token").and_then(|t| t.as_str()) {
        Some(token) => Ok(token.to_string()),
        None => Err(unexpected_response(status, &body)),
    }
}

/// Exchange phone/password (plus the anonymous token) for a full session.
///
/// `recaptcha` carries the captcha answer on a retry after the server
/// rejected the first attempt with `invalid_recaptcha`.
pub async fn password_grant(
    client: &reqwest::Client,
    base_url: &str,
    phone: &str,
    password: &str,
    anonymous_token: &str,
    recaptcha: Option<&str>,
) -> Result<(TokenResponse, Vec<SessionCookie>)> {
    let mut form: Vec<(&str, &str)> = vec![
        ("token_type", TOKEN_TYPE),
        ("grant_type", "password"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("anonymous_token_head", anonymous_token),
        ("username", phone),
        ("password", password),
    ];
    if let Some(answer) = recaptcha {
        form.push(("recaptcha", answer));
    }

    execute_grant(client, base_url, &form).await
}

/// Renew the session with the current access/refresh token pair.
pub async fn refresh_grant(
    client: &reqwest::Client,
    base_url: &str,
    token_head: &str,
    refresh_token: &str,
) -> Result<(TokenResponse, Vec<SessionCookie>)> {
    let form: Vec<(&str, &str)> = vec![
        ("token_type", TOKEN_TYPE),
        ("grant_type", "refresh_token"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("token_head", token_head),
        ("refresh_token", refresh_token),
    ];

    execute_grant(client, base_url, &form).await
}

/// Run one grant round-trip and classify the response.
async fn execute_grant(
    client: &reqwest::Client,
    base_url: &str,
    form: &[(&str, &str)],
) -> Result<(TokenResponse, Vec<SessionCookie>)> {
    let response = client
        .post(format!("{base_url}{TOKEN_PATH}"))
        .form(form)
        .send()
        .await
        .map_err(|e| Error::ProxyConnection(format!("token request failed: {e}")))?;

    let status = response.status();
    let cookies = cookies::from_response(&response);
    let body = response
        .text()
        .await
        .map_err(|e| Error::ProxyConnection(format!("reading token response: {e}")))?;

    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|_| unexpected_response(status, &body))?;

    // The error field is authoritative over the status line
    if let Some(error) = value.get("error") {
        if error == "invalid_recaptcha" {
            return Err(Error::RecaptchaRequired);
        }
        return Err(Error::AuthenticationFailed(body));
    }

    if !status.is_success() {
        return Err(Error::ProxyConnection(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = serde_json::from_value(value)
        .map_err(|_| Error::AuthenticationFailed(UNKNOWN_AUTH_ERROR.into()))?;
    Ok((token, cookies))
}

/// Classify a response whose body did not have the expected shape.
fn unexpected_response(status: reqwest::StatusCode, body: &str) -> Error {
    if status.is_success() {
        Error::AuthenticationFailed(UNKNOWN_AUTH_ERROR.into())
    } else {
        Error::ProxyConnection(format!("token endpoint returned {status}: {body}"))
    }
}
