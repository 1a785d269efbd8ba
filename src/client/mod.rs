//! Queue client: the single request primitive.
//!
//! Callers see `get`/`post` returning a parsed response or `None`; under
//! the hood the client borrows an account for its queue, executes, hands
//! the response to the classifier, and acts on the verdict: releasing with
//! a penalty and borrowing another account, aborting the call, or passing
//! the response up. Every exit path releases the borrow: explicitly on
//! success and penalty, via the borrow's drop guard on cancellation or
//! propagated errors.

pub mod classify;
pub mod ctx;
pub mod transport;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{SendError, StaleCatalog, TransportError};
use crate::pool::AccountsPool;
use crate::rate_log::{RateEvent, RateLimitLog, ResponseDump};
use crate::token::TokenSource;
use classify::{classify, Classification, Release, Verdict};
use ctx::Ctx;
use transport::{ApiRequest, ApiResponse, TransportFactory};

/// Connect and unknown errors give the same account three chances before
/// escalating.
const CONNECT_RETRIES: u32 = 3;
const UNKNOWN_RETRIES: u32 = 3;
const UNKNOWN_LOCK_SECS: i64 = 15 * 60;

/// Shared plumbing every queue client needs; cheap to clone.
#[derive(Clone)]
pub struct ClientEnv {
    pub tokens: Arc<TokenSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub rate_log: Option<Arc<RateLimitLog>>,
    pub dump: Option<Arc<ResponseDump>>,
    pub proxy: Option<String>,
}

pub struct QueueClient {
    pool: AccountsPool,
    queue: String,
    env: ClientEnv,
    ctx: Option<Ctx>,
}

impl QueueClient {
    pub fn new(pool: AccountsPool, queue: impl Into<String>, env: ClientEnv) -> Self {
        Self {
            pool,
            queue: queue.into(),
            env,
            ctx: None,
        }
    }

    pub async fn get(&mut self, url: &str, params: Vec<(String, String)>) -> Result<Option<ApiResponse>> {
        let mut request = ApiRequest::get(url);
        request.params = params;
        self.req(request).await
    }

    pub async fn post(&mut self, url: &str, body: Value) -> Result<Option<ApiResponse>> {
        self.req(ApiRequest::post(url, body)).await
    }

    /// Run one request to completion: all retries (other-account, token
    /// refresh, transient transport) are invisible to the caller. `None`
    /// means the call was aborted (dependency error without data, token
    /// machinery broken, or no account with `raise_when_no_account`). A
    /// stale-catalog (336) response propagates as [`StaleCatalog`].
    pub async fn req(&mut self, request: ApiRequest) -> Result<Option<ApiResponse>> {
        let mut unknown_retry = 0u32;
        let mut connect_retry = 0u32;

        loop {
            if !self.acquire().await? {
                return Ok(None);
            }
            let sent = match self.ctx.as_ref() {
                Some(ctx) => ctx.send(&request).await,
                None => return Ok(None),
            };

            match sent {
                Ok(rep) => {
                    if let Some(dump) = &self.env.dump {
                        dump.write(&rep).await;
                    }
                    let classification = classify(&rep, self.pool.reputation());
                    self.log_event(&rep, &classification).await;

                    match classification.verdict {
                        Verdict::Accept => {
                            if let Some(ctx) = self.ctx.as_mut() {
                                ctx.req_count += 1;
                            }
                            return Ok(Some(rep));
                        }
                        Verdict::Retry(release) => {
                            self.release_ctx(Some(release)).await?;
                            continue;
                        }
                        Verdict::Abort => return Ok(None),
                        Verdict::Fatal(msg) => {
                            // Developer signal, not an account problem: no
                            // penalty, and the embedder decides how to stop.
                            error!(err = %msg, "operation catalog outdated — update required");
                            self.release_ctx(None).await?;
                            return Err(StaleCatalog(msg).into());
                        }
                    }
                }
                Err(SendError::Abort(msg)) => {
                    warn!(queue = %self.queue, err = %msg, "request aborted");
                    return Ok(None);
                }
                Err(SendError::Transport(e)) => match e {
                    TransportError::ReadTimeout | TransportError::Proxy(_) => {
                        // Transient; retry on the same account, uncounted.
                        debug!(queue = %self.queue, err = %e, "transport hiccup — retrying");
                        continue;
                    }
                    TransportError::Connect(_) => {
                        connect_retry += 1;
                        if connect_retry >= CONNECT_RETRIES {
                            return Err(e.into());
                        }
                        warn!(queue = %self.queue, attempt = connect_retry, err = %e, "connect failed — retrying");
                    }
                    TransportError::Other(_) => {
                        unknown_retry += 1;
                        if unknown_retry >= UNKNOWN_RETRIES {
                            warn!(
                                queue = %self.queue,
                                err = %e,
                                "unknown error — account timed out for 15 minutes"
                            );
                            let until = chrono::Utc::now().timestamp() + UNKNOWN_LOCK_SECS;
                            self.release_ctx(Some(Release::Until(until))).await?;
                            unknown_retry = 0;
                        }
                    }
                },
            }
        }
    }

    /// Release the held account, charging its successful-request count, and
    /// drop the transport. Idempotent; call when done with this queue.
    pub async fn close(&mut self) -> Result<()> {
        self.release_ctx(None).await
    }

    /// Ensure an account is held. `false` only when the pool is configured
    /// to give up instead of waiting.
    async fn acquire(&mut self) -> Result<bool> {
        if self.ctx.is_some() {
            return Ok(true);
        }
        let borrow = match self.pool.get_for_queue_or_wait(&self.queue).await? {
            Some(borrow) => borrow,
            None => return Ok(false),
        };
        let transport = self
            .env
            .transports
            .build(&borrow.account, self.env.proxy.as_deref())?;
        self.ctx = Some(Ctx::new(borrow, transport, Arc::clone(&self.env.tokens)));
        Ok(true)
    }

    /// `None` releases as immediately available; `Some` applies the
    /// classifier's penalty. Either way the request count is charged and
    /// the transport dropped.
    async fn release_ctx(&mut self, release: Option<Release>) -> Result<()> {
        let Some(ctx) = self.ctx.take() else {
            return Ok(());
        };
        let req_count = ctx.req_count;
        let Ctx { borrow, .. } = ctx;
        match release {
            None => borrow.release(req_count).await,
            Some(Release::Until(ts)) => borrow.release_until(ts, req_count).await,
            Some(Release::Inactive(msg)) => borrow.release_inactive(msg.as_deref()).await,
        }
    }

    async fn log_event(&self, rep: &ApiResponse, classification: &Classification) {
        let Some(log) = &self.env.rate_log else {
            return;
        };
        let Some(event) = classification.event else {
            return;
        };
        if event == "success" && !log.should_log_success(rep.rate.remaining) {
            return;
        }
        log.append(&RateEvent::from_response(rep, event, &classification.err_msg))
            .await;
    }
}
