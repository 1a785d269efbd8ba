//! Request executor: one account bound to one transport.
//!
//! A `Ctx` lives for exactly one pool acquisition. It owns the transport
//! (dropped on release) and the count of successful requests charged back
//! to the store when the queue client releases the borrow.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::client::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::SendError;
use crate::pool::Borrow;
use crate::token::TokenSource;

/// A 404 usually means the transaction id went stale; regenerate and retry
/// this many times before aborting the caller's operation.
const TOKEN_RETRIES: u32 = 3;
const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Ctx {
    pub borrow: Borrow,
    transport: Box<dyn Transport>,
    tokens: Arc<TokenSource>,
    /// Successful requests this acquisition; incremented by the queue
    /// client only after the classifier accepts a response.
    pub req_count: i64,
}

impl Ctx {
    pub fn new(borrow: Borrow, transport: Box<dyn Transport>, tokens: Arc<TokenSource>) -> Self {
        Self {
            borrow,
            transport,
            tokens,
            req_count: 0,
        }
    }

    pub fn username(&self) -> &str {
        self.borrow.username()
    }

    /// Issue one HTTP call with a transaction id for (method, path).
    ///
    /// On 404 the cached generator is discarded and the call retried with a
    /// fresh id, up to [`TOKEN_RETRIES`] times; a persistent 404 aborts the
    /// outer operation without penalizing the account.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, SendError> {
        let path = request.path();
        let username = self.borrow.username();

        let mut attempt = 0;
        loop {
            let gen = self
                .tokens
                .get(username, attempt > 0)
                .await
                .map_err(|e| SendError::Abort(e.to_string()))?;

            let mut wire = request.clone();
            wire.headers.push((
                "x-client-transaction-id".to_string(),
                gen.calc(&request.method, &path),
            ));

            let mut rep = self.transport.send(&wire).await?;
            if rep.status != 404 {
                rep.username = username.to_string();
                return Ok(rep);
            }

            attempt += 1;
            if attempt > TOKEN_RETRIES {
                return Err(SendError::Abort(format!(
                    "{} still 404 after {TOKEN_RETRIES} transaction-id refreshes",
                    request.url
                )));
            }
            debug!(url = %request.url, attempt, "404 — retrying with fresh transaction id");
            tokio::time::sleep(TOKEN_RETRY_DELAY).await;
        }
    }
}
