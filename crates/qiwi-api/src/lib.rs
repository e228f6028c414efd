//! QIWI wallet edge API surface
//!
//! Stateless pass-through calls over an authenticated
//! [`AuthSession`](qiwi_auth::AuthSession). Every method builds an edge URL,
//! issues the request through the session's shared client (which carries the
//! derived `TokenHeadV2` authorization header) and returns the parsed JSON
//! body verbatim. No retries, no pagination handling, no response
//! interpretation; that is the caller's business.

pub mod error;

pub use error::{Error, Result};

use std::sync::Arc;

use qiwi_auth::AuthSession;
use serde_json::{Value, json};

/// Base URL of the wallet edge API.
pub const EDGE_BASE_URL: &str = "https://edge.qiwi.com";

/// Wallet API client over an authenticated session.
pub struct WalletApi {
    session: Arc<AuthSession>,
    base_url: String,
}

impl std::fmt::Debug for WalletApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WalletApi {
    /// Wrap an authenticated session.
    ///
    /// Fails with [`Error::InvalidSession`], without issuing any request,
    /// when the session has never authenticated or has been closed.
    pub fn new(session: Arc<AuthSession>) -> Result<Self> {
        Self::with_base_url(session, EDGE_BASE_URL)
    }

    /// Wrap a session against a non-default edge host (mock servers in tests).
    pub fn with_base_url(session: Arc<AuthSession>, base_url: impl Into<String>) -> Result<Self> {
        if session.is_closed() {
            return Err(Error::InvalidSession("session is closed".into()));
        }
        if !session.is_authenticated() {
            return Err(Error::InvalidSession(
                "session has not authenticated".into(),
            ));
        }
        Ok(Self {
            session,
            base_url: base_url.into(),
        })
    }

    /// The session this client issues requests through.
    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// Profile of the authenticated wallet owner.
    pub async fn current_profile(&self) -> Result<Value> {
        self.get("/person-profile/v2/profile/current", &[]).await
    }

    /// Funding sources (balances) of a person.
    pub async fn funding_sources(&self, person_id: &str) -> Result<Value> {
        self.get(&format!("/funding-sources/v2/persons/{person_id}/accounts"), &[])
            .await
    }

    /// Identification records of a person.
    pub async fn identification(&self, person_id: &str) -> Result<Value> {
        self.get(
            &format!("/identification/v4/persons/{person_id}/identifications"),
            &[],
        )
        .await
    }

    /// Invoice counters, optionally filtered by status.
    pub async fn checkout_count(&self, statuses: Option<&str>) -> Result<Value> {
        let mut query = Vec::new();
        if let Some(statuses) = statuses {
            query.push(("statuses", statuses.to_string()));
        }
        self.get("/checkout-api/api/bill/count", &query).await
    }

    /// Cards linked to the wallet.
    pub async fn cards(&self) -> Result<Value> {
        self.get("/cards/v1/cards", &[]).await
    }

    /// Payment history page.
    ///
    /// `next` is the continuation pair (`nextTxnId`, `nextTxnDate`) from the
    /// previous page; both values travel together or not at all.
    pub async fn payments(
        &self,
        person_id: &str,
        rows: u32,
        next: Option<(&str, &str)>,
    ) -> Result<Value> {
        let mut query = vec![("rows", rows.to_string())];
        if let Some((next_txn_id, next_txn_date)) = next {
            query.push(("nextTxnId", next_txn_id.to_string()));
            query.push(("nextTxnDate", next_txn_date.to_string()));
        }
        self.get(
            &format!("/payment-history/v2/persons/{person_id}/payments"),
            &query,
        )
        .await
    }

    /// Payment totals over a date range.
    pub async fn payments_total(
        &self,
        person_id: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Value> {
        self.get(
            &format!("/payment-history/v2/persons/{person_id}/payments/total"),
            &[
                ("startDate", start_date.to_string()),
                ("endDate", end_date.to_string()),
            ],
        )
        .await
    }

    /// A single transaction, optionally narrowed by direction.
    pub async fn transaction(
        &self,
        transaction_id: &str,
        transaction_type: Option<&str>,
    ) -> Result<Value> {
        let mut query = Vec::new();
        if let Some(transaction_type) = transaction_type {
            query.push(("type", transaction_type.to_string()));
        }
        self.get(
            &format!("/payment-history/v2/transactions/{transaction_id}"),
            &query,
        )
        .await
    }

    /// Generate a public key for p2p invoicing.
    pub async fn generate_p2p_public_key(&self) -> Result<Value> {
        self.post("/widgets-api/api/p2p/protected/generate-public-key", None)
            .await
    }

    /// Create a p2p invoice through the checkout widget API.
    pub async fn create_invoice(
        &self,
        p2p_key: &str,
        widget_code: &str,
        amount: f64,
        comment: &str,
        currency: &str,
    ) -> Result<Value> {
        let body = json!({
            "amount": amount,
            "currency": currency,
            "extras": [
                { "code": "themeCode", "value": widget_code },
                { "code": "apiClient", "value": "p2p-admin" },
                { "code": "apiClientVersion", "value": "0.17.0" },
                { "code": "paySourcesFilter", "value": "card,qw,mobile" },
            ],
            "comment": comment,
            "customers": [],
            "public_key": p2p_key,
        });
        self.post("/checkout-api/invoice/create", Some(&body)).await
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self.session.get_json(&url, query).await?)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self.session.post_json(&url, body).await?)
    }
}
