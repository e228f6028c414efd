//! Authenticated wallet session
//!
//! `AuthSession` owns the transport binding, the credentials and the token
//! state. The installed state (token, cookie snapshot, derived API token
//! header) lives behind an `RwLock<Option<Arc<SessionState>>>` and is only
//! ever replaced wholesale: requests clone the `Arc` under a read lock, so a
//! concurrent refresh can never be observed half-applied. A `Mutex` keeps at
//! most one refresh round-trip in flight.
//!
//! Lifecycle: build → `authenticate()` (retryable with a captcha answer) →
//! background refresh task keeps the token fresh → `close()` stops the task
//! and fails every further request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info};

use crate::constants::{API_TOKEN_SCHEME, BASE_URL, CLIENT_ID, EXPIRY_MARGIN_SECS};
use crate::cookies::SessionCookie;
use crate::error::{Error, Result};
use crate::proxy::{self, ProxyConfig};
use crate::refresh;
use crate::secret::Secret;
use crate::token::{self, TokenResponse};

/// Installed token data from a successful password or refresh grant.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Expiry delta as reported by the server, in seconds
    pub server_expires_in: u64,
    /// Margin-adjusted delta the refresh loop sleeps on; floored at zero
    pub refresh_after: Duration,
    /// When the grant completed
    pub created: DateTime<Utc>,
    /// Fixed client id the token was issued to
    pub client_id: &'static str,
}

impl TokenState {
    fn new(response: TokenResponse) -> Self {
        let refresh_after =
            Duration::from_secs(response.expires_in.saturating_sub(EXPIRY_MARGIN_SECS));
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            server_expires_in: response.expires_in,
            refresh_after,
            created: Utc::now(),
            client_id: CLIENT_ID,
        }
    }

    /// Compact JSON blob of the installed token for external persistence.
    ///
    /// Keys are emitted in wire order with no inter-field whitespace;
    /// `created` is ISO-8601 UTC with microsecond precision.
    pub fn auth_data(&self) -> String {
        #[derive(serde::Serialize)]
        struct AuthData<'a> {
            expires_in: u64,
            token_type: &'a str,
            access_token: &'a str,
            refresh_token: &'a str,
            created: String,
            client_id: &'a str,
        }

        let blob = AuthData {
            expires_in: self.server_expires_in,
            token_type: &self.token_type,
            access_token: &self.access_token,
            refresh_token: &self.refresh_token,
            created: self.created.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            client_id: self.client_id,
        };
        serde_json::to_string(&blob).unwrap_or_default()
    }
}

/// Atomic view of the authenticated session.
///
/// Replaced wholesale on every grant, never mutated in place.
struct SessionState {
    token: TokenState,
    cookies: Vec<SessionCookie>,
    /// Full `Authorization` header value, `TokenHeadV2 <base64>`
    authorization: String,
}

/// Derived API token header value for an access token.
fn derive_api_token(access_token: &str) -> String {
    let key = STANDARD.encode(format!("{CLIENT_ID}:{access_token}"));
    format!("{API_TOKEN_SCHEME} {key}")
}

/// Long-lived authenticated wallet session.
///
/// One instance per phone/password pair; share it as an `Arc`. All requests
/// (foreground API calls and the background refresh alike) go through the
/// one `reqwest::Client` built by the transport binding.
pub struct AuthSession {
    /// Self-reference handed to the refresh task, so the task never keeps a
    /// dropped session alive
    weak: Weak<AuthSession>,
    phone: String,
    password: Secret,
    base_url: String,
    client: reqwest::Client,
    state: RwLock<Option<Arc<SessionState>>>,
    /// Serializes refresh round-trips
    refresh_lock: Mutex<()>,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    stale: AtomicBool,
    authenticated: AtomicBool,
}

/// Builder for [`AuthSession`].
pub struct AuthSessionBuilder {
    phone: String,
    password: String,
    proxy: Option<ProxyConfig>,
    base_url: String,
}

impl AuthSessionBuilder {
    /// Route all session traffic through a proxy.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Override the wallet base URL (mock servers in tests).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the transport binding and the session around it.
    pub fn build(self) -> Result<Arc<AuthSession>> {
        let client = proxy::build_client(self.proxy.as_ref())?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|weak| AuthSession {
            weak: weak.clone(),
            phone: self.phone,
            password: Secret::new(self.password),
            base_url: self.base_url,
            client,
            state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_task: Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
        }))
    }
}

impl AuthSession {
    /// Start building a session for the given credentials.
    pub fn builder(phone: impl Into<String>, password: impl Into<String>) -> AuthSessionBuilder {
        AuthSessionBuilder {
            phone: phone.into(),
            password: password.into(),
            proxy: None,
            base_url: BASE_URL.into(),
        }
    }

    /// Run the credential exchange and install the session state.
    ///
    /// Pass the captcha answer on retry after [`Error::RecaptchaRequired`].
    /// The first successful exchange also starts the background refresh task.
    pub async fn authenticate(&self, recaptcha: Option<&str>) -> Result<()> {
        self.ensure_open()?;

        let anonymous = token::anonymous_token(&self.client, &self.base_url).await?;
        let (response, cookies) = token::password_grant(
            &self.client,
            &self.base_url,
            &self.phone,
            self.password.expose(),
            &anonymous,
            recaptcha,
        )
        .await?;

        self.install(response, cookies).await;
        info!("wallet session authenticated");

        // First success starts the refresh task; a later re-authentication
        // restarts it only if the previous loop ended (stale termination)
        let mut task = self.refresh_task.lock().await;
        if task.as_ref().is_none_or(|t| t.is_finished()) {
            *task = Some(refresh::spawn_refresh_task(
                self.weak.clone(),
                self.shutdown.subscribe(),
            ));
            debug!("background refresh task started");
        }
        Ok(())
    }

    /// Stop the refresh task and fail all further requests.
    ///
    /// Interrupts the task's pending sleep rather than leaving it dangling
    /// on a closed session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.refresh_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("wallet session closed");
    }

    /// Issue an authenticated GET and return the parsed JSON body verbatim.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        self.execute(self.client.get(url).query(query)).await
    }

    /// Issue an authenticated POST, optionally with a JSON body, and return
    /// the parsed JSON body verbatim.
    pub async fn post_json(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request).await
    }

    /// Phone identifier the session authenticates as.
    pub fn phone(&self) -> &str {
        &self.phone
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether at least one credential exchange has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the refresh loop gave up on a rejected refresh grant. The
    /// installed token may be stale; the caller must `authenticate` again.
    pub fn needs_reauthentication(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Snapshot of the installed token, if any.
    pub async fn token(&self) -> Option<TokenState> {
        self.state.read().await.as_ref().map(|s| s.token.clone())
    }

    /// Cookie snapshot from the most recent (re)authentication.
    pub async fn cookies(&self) -> Vec<SessionCookie> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.cookies.clone())
            .unwrap_or_default()
    }

    /// Current `Authorization` header value, if authenticated.
    pub async fn authorization_header(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.authorization.clone())
    }

    /// Serialized auth-data blob of the installed token, if any.
    pub async fn auth_data(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.token.auth_data())
    }

    /// Run one refresh grant under the refresh lock and install the result.
    ///
    /// The lock keeps at most one refresh round-trip in flight no matter how
    /// many triggers fire concurrently.
    pub(crate) async fn refresh_once(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.ensure_open()?;

        let (token_head, refresh_token) = {
            let state = self.state.read().await;
            let state = state
                .as_ref()
                .ok_or_else(|| Error::AuthenticationFailed("no installed token to refresh".into()))?;
            (
                state.token.access_token.clone(),
                state.token.refresh_token.clone(),
            )
        };

        let (response, cookies) =
            token::refresh_grant(&self.client, &self.base_url, &token_head, &refresh_token).await?;
        self.install(response, cookies).await;
        Ok(())
    }

    /// Margin-adjusted delay until the installed token should be refreshed.
    pub(crate) async fn refresh_after(&self) -> Option<Duration> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.token.refresh_after)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Atomically replace the session state with a fresh grant result.
    async fn install(&self, response: TokenResponse, cookies: Vec<SessionCookie>) {
        let token = TokenState::new(response);
        let authorization = derive_api_token(&token.access_token);
        debug!(
            refresh_after_secs = token.refresh_after.as_secs(),
            "token state installed"
        );
        let next = Arc::new(SessionState {
            token,
            cookies,
            authorization,
        });
        *self.state.write().await = Some(next);
        self.authenticated.store(true, Ordering::SeqCst);
        self.stale.store(false, Ordering::SeqCst);
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        self.ensure_open()?;
        let authorization = {
            let state = self.state.read().await;
            let state = state
                .as_ref()
                .ok_or_else(|| Error::AuthenticationFailed("session has not authenticated".into()))?;
            state.authorization.clone()
        };

        let response = request
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| Error::ProxyConnection(format!("request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| Error::ProxyConnection(format!("reading response body: {e}")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn token_body(access: &str, refresh: &str, expires_in: u64) -> serde_json::Value {
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "token_type": "headtail",
            "expires_in": expires_in
        })
    }

    fn grant(needle: &'static str) -> impl Fn(&Request) -> bool {
        move |request: &Request| String::from_utf8_lossy(&request.body).contains(needle)
    }

    async fn mount_anonymous(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=anonymous"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "anon_at"})),
            )
            .mount(server)
            .await;
    }

    async fn mount_password(server: &MockServer, access: &str, expires_in: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body(access, "rt_1", expires_in))
                    .append_header("set-cookie", "qw_session=abc; Path=/; HttpOnly"),
            )
            .mount(server)
            .await;
    }

    fn session_for(server: &MockServer) -> Arc<AuthSession> {
        AuthSession::builder("79990001122", "hunter2")
            .base_url(server.uri())
            .build()
            .unwrap()
    }

    fn expected_authorization(access: &str) -> String {
        format!("TokenHeadV2 {}", STANDARD.encode(format!("web-qw:{access}")))
    }

    #[tokio::test]
    async fn authenticate_installs_margin_adjusted_token() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        let token = session.token().await.unwrap();
        assert_eq!(token.access_token, "at_1");
        assert_eq!(token.token_type, "headtail");
        assert_eq!(token.server_expires_in, 3600);
        assert_eq!(token.refresh_after, Duration::from_secs(3300));
        assert_eq!(token.client_id, "web-qw");
        assert!(session.is_authenticated());

        let authorization = session.authorization_header().await.unwrap();
        assert_eq!(authorization, expected_authorization("at_1"));

        let cookies = session.cookies().await;
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "qw_session");
        assert_eq!(cookies[0].value, "abc");
        assert_eq!(cookies[0].domain, ".qiwi.com");
    }

    #[tokio::test]
    async fn short_expiry_floors_at_zero() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 100).await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        let token = session.token().await.unwrap();
        assert_eq!(token.server_expires_in, 100);
        assert_eq!(token.refresh_after, Duration::ZERO);
    }

    #[tokio::test]
    async fn captcha_gated_retry_flow() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        // No captcha answer in the body: rejected
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(|request: &Request| {
                let body = String::from_utf8_lossy(&request.body);
                body.contains("grant_type=password") && !body.contains("recaptcha=")
            })
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "invalid_recaptcha"})),
            )
            .mount(&server)
            .await;
        // Retry carrying the answer succeeds
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(|request: &Request| {
                let body = String::from_utf8_lossy(&request.body);
                body.contains("grant_type=password") && body.contains("recaptcha=captcha-answer")
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at_1", "rt_1", 3600)))
            .mount(&server)
            .await;

        let session = session_for(&server);
        let err = session.authenticate(None).await.unwrap_err();
        assert!(matches!(err, Error::RecaptchaRequired), "got: {err}");
        assert!(!session.is_authenticated());

        session.authenticate(Some("captcha-answer")).await.unwrap();
        let token = session.token().await.unwrap();
        assert_eq!(token.access_token, "at_1");
    }

    #[tokio::test]
    async fn reauthentication_replaces_cookie_snapshot() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at_1", "rt_1", 3600))
                    .append_header("set-cookie", "first=1")
                    .append_header("set-cookie", "shared=old"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at_2", "rt_2", 3600))
                    .append_header("set-cookie", "second=2"),
            )
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();
        assert_eq!(session.cookies().await.len(), 2);

        session.authenticate(None).await.unwrap();
        let cookies = session.cookies().await;
        // Snapshot of the second response only, nothing carried over
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "second");
    }

    #[tokio::test]
    async fn refresh_replaces_token_and_derived_header() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at_2", "rt_2", 7200))
                    .append_header("set-cookie", "refreshed=1"),
            )
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();
        session.refresh_once().await.unwrap();

        let token = session.token().await.unwrap();
        assert_eq!(token.access_token, "at_2");
        assert_eq!(token.refresh_after, Duration::from_secs(6900));
        assert_eq!(
            session.authorization_header().await.unwrap(),
            expected_authorization("at_2")
        );
        let cookies = session.cookies().await;
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "refreshed");
    }

    #[tokio::test]
    async fn refreshes_serialize_under_the_lock() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;
        let delay = Duration::from_millis(150);
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(grant("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at_2", "rt_2", 3600))
                    .set_delay(delay),
            )
            .expect(3)
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                session.refresh_once().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Serialized round-trips cannot complete faster than 3x the per-request delay
        assert!(
            started.elapsed() >= delay * 3,
            "refreshes overlapped: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn close_prevents_further_requests() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();
        session.close().await;

        assert!(session.is_closed());
        let err = session
            .get_json(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed), "got: {err}");

        let err = session.authenticate(None).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed), "got: {err}");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_prompt() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        // The refresh task is mid-sleep for ~3300s; close must not wait it out
        let started = Instant::now();
        session.close().await;
        session.close().await;
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "close blocked on the sleeping refresh task"
        );
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_locally() {
        let server = MockServer::start().await;
        let session = session_for(&server);

        let err = session
            .get_json(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)), "got: {err}");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requests_carry_the_current_derived_token() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;
        let expected = expected_authorization("at_1");
        Mock::given(method("GET"))
            .and(path("/person"))
            .and(header("authorization", expected.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        let body = session
            .get_json(&format!("{}/person", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn auth_data_blob_is_compact_and_ordered() {
        let server = MockServer::start().await;
        mount_anonymous(&server).await;
        mount_password(&server, "at_1", 3600).await;

        let session = session_for(&server);
        session.authenticate(None).await.unwrap();

        let blob = session.auth_data().await.unwrap();
        assert!(
            blob.starts_with(
                r#"{"expires_in":3600,"token_type":"headtail","access_token":"at_1","refresh_token":"rt_1","created":""#
            ),
            "blob: {blob}"
        );
        assert!(blob.ends_with(r#"Z","client_id":"web-qw"}"#), "blob: {blob}");
        assert!(!blob.contains(": "), "blob: {blob}");
        assert!(!blob.contains(", "), "blob: {blob}");

        // created carries microsecond precision
        let created_start = blob.find(r#""created":""#).unwrap() + r#""created":""#.len();
        let created = &blob[created_start..];
        let micros = created
            .split('.')
            .nth(1)
            .and_then(|tail| tail.split('Z').next())
            .unwrap();
        assert_eq!(micros.len(), 6, "created fraction: {micros}");
    }

    #[tokio::test]
    async fn phone_is_exposed() {
        let server = MockServer::start().await;
        let session = session_for(&server);
        assert_eq!(session.phone(), "79990001122");
    }
}
