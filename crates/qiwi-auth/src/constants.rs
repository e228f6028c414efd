//! QIWI wallet web client constants
//!
//! Fixed client identification matching the wallet web frontend. Nothing
//! here is a secret in the credential sense; the password and the issued
//! access/refresh tokens live in the session.

/// Wallet root, host of the token endpoint
pub const BASE_URL: &str = "https://qiwi.com";

/// Token endpoint path, shared by all three grant types
pub const TOKEN_PATH: &str = "/oauth/token";

/// Client id of the wallet web frontend
pub const CLIENT_ID: &str = "web-qw";

/// Client secret paired with [`CLIENT_ID`]
pub const CLIENT_SECRET: &str = "P0CGsaulvHy9";

/// Client id used for the bootstrap anonymous grant
pub const ANONYMOUS_CLIENT_ID: &str = "anonymous";

/// Token type the wallet issues for web sessions
pub const TOKEN_TYPE: &str = "headtail";

/// Scheme of the derived `Authorization` header
pub const API_TOKEN_SCHEME: &str = "TokenHeadV2";

/// Domain every session cookie is pinned to, regardless of server scoping
pub const COOKIE_DOMAIN: &str = ".qiwi.com";

/// `User-Agent` the wallet expects from this client build
pub const USER_AGENT: &str = "okhttp/4.9.1";

/// Fixed `client-software` version header
pub const CLIENT_SOFTWARE: &str = "WEB v4.127.2";

/// Safety margin subtracted from the server-reported expiry so a refresh
/// always runs strictly before the access token actually expires
pub const EXPIRY_MARGIN_SECS: u64 = 300;

/// Per-request timeout on the shared HTTP client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Delay before retrying a refresh that failed for a transient reason
pub const REFRESH_RETRY_DELAY_SECS: u64 = 30;
