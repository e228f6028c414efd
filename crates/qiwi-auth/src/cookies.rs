//! Session cookie snapshot
//!
//! The wallet sets session cookies on the token response. Callers replicating
//! the session elsewhere (another client, a browser context) need them with
//! the domain pinned to the wallet root, so the snapshot ignores whatever
//! scope the server sent. The snapshot is rebuilt from scratch on every
//! (re)authentication; cookies are never merged across responses.

use reqwest::header::SET_COOKIE;
use serde::Serialize;

use crate::constants::COOKIE_DOMAIN;

/// One cookie from the most recent (re)authentication response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Extract the cookie snapshot from a token response.
pub fn from_response(response: &reqwest::Response) -> Vec<SessionCookie> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

/// Parse the name/value pair of a `Set-Cookie` header, dropping attributes.
fn parse_set_cookie(header: &str) -> Option<SessionCookie> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(SessionCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain: COOKIE_DOMAIN.to_string(),
    })
}
