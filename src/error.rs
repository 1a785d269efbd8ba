//! Typed errors for the request pipeline.
//!
//! Only the errors the queue-client state machine *matches on* get enum
//! variants here. Store, config, and other plumbing fallibility uses
//! `anyhow::Result` with context instead.

use thiserror::Error;

/// Transport-level failure, already bucketed for the retry policy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server accepted the connection but the read timed out.
    /// Retried on the same account, not counted.
    #[error("read timeout")]
    ReadTimeout,

    /// Proxy refused or dropped the connection.
    /// Retried on the same account, not counted.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Could not establish a connection (DNS, refused, TLS, connect timeout).
    /// Retried up to 3 times on the same account, then propagated.
    #[error("connect error: {0}")]
    Connect(String),

    /// Anything else, treated as an unknown transient.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Bucket a `reqwest` error into the retry taxonomy.
    ///
    /// Connect-phase failures are checked first: a `connect_timeout()`
    /// elapsing reports `is_timeout()` *and* `is_connect()`, and it must
    /// land in the bounded `Connect` bucket, not the retry-forever
    /// `ReadTimeout` one.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let msg = e.to_string();
        if e.is_connect() {
            // reqwest has no dedicated proxy error kind; a failed CONNECT
            // surfaces as a connect error whose chain mentions the proxy.
            if msg.contains("proxy") {
                return TransportError::Proxy(msg);
            }
            return TransportError::Connect(msg);
        }
        if e.is_timeout() {
            return TransportError::ReadTimeout;
        }
        TransportError::Other(msg)
    }
}

/// Failure of a single executor call (one `Ctx::send`).
#[derive(Debug, Error)]
pub enum SendError {
    /// The token machinery is broken for this account (persistent 404 or
    /// generator init failure). Aborts the caller's operation without
    /// penalizing the account.
    #[error("request aborted: {0}")]
    Abort(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The remote reported `(336) The following features cannot be null`: the
/// operation catalog is missing feature flags the platform now requires.
/// Retrying cannot help on any account; the embedder decides whether that
/// means shutting down.
#[derive(Debug, Error)]
#[error("operation catalog outdated, update required: {0}")]
pub struct StaleCatalog(pub String);
