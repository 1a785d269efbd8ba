//! Response classification.
//!
//! Inspects status, rate-limit headers, and body error codes, and reduces
//! them to one verdict the queue client's state machine acts on. Identical
//! HTTP statuses mean different things depending on body error codes and
//! remaining quota, so the checks run in a fixed order.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::client::transport::ApiResponse;
use crate::pool::reputation::ReputationBook;

/// Lock after this many consecutive soft errors.
const SOFT_ERROR_THRESHOLD: u32 = 5;
const SOFT_ERROR_LOCK_MINUTES: i64 = 3;
/// A `(29) Timeout` is the platform telling us to slow down; lock at once.
const TIMEOUT_LOCK_MINUTES: i64 = 2;
/// Mark inactive at this many ban strikes (~24 h of cumulative backoff).
const BAN_STRIKE_MAX: u32 = 6;
/// Backoff sequence: 60, 120, 240, 480, then the remainder to 24 h (540).
const BAN_BACKOFF_BASE_MINUTES: i64 = 60;
const BAN_BACKOFF_CAP_MINUTES: i64 = 24 * 60;
/// Unrecognized failure statuses time the account out for 15 minutes.
const UNHANDLED_STATUS_LOCK_MINUTES: i64 = 15;

/// How to release the current account when retrying on another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Penalty lock until this epoch second.
    Until(i64),
    /// Durable deactivation, with the error message that earned it.
    Inactive(Option<String>),
}

/// The classifier's decision for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the response to the caller as-is (it may still carry body-level
    /// errors the parser tolerates).
    Accept,
    /// Release the current account per [`Release`] and retry on another.
    Retry(Release),
    /// Terminate the whole call; no response, no account penalty.
    Abort,
    /// Developer signal: the operation catalog is stale. Retrying cannot
    /// help on any account; the queue client surfaces this as a terminal
    /// error.
    Fatal(String),
}

/// Verdict plus the context the queue client logs alongside it.
#[derive(Debug)]
pub struct Classification {
    pub verdict: Verdict,
    /// `(code) message; …` summary of the body errors, `"OK"` when clean.
    pub err_msg: String,
    /// Rate-event tag for the JSONL log, when this outcome is logged.
    pub event: Option<&'static str>,
}

impl Classification {
    fn new(verdict: Verdict, err_msg: String, event: Option<&'static str>) -> Self {
        Self {
            verdict,
            err_msg,
            event,
        }
    }
}

/// Classify one response. Reputation counters move here; penalty timestamps
/// are computed here; the queue client applies the release.
pub fn classify(rep: &ApiResponse, reputation: &ReputationBook) -> Classification {
    let mut err_msg = rep.formatted_errors();
    let username = rep.username.as_str();
    let rate = rep.rate;

    debug!(
        status = rep.status,
        username,
        remaining = rate.remaining,
        limit = rate.limit,
        err = %err_msg,
        "classifying response"
    );

    // Stale operation catalog; a developer must update the feature set.
    if err_msg.starts_with("(336) The following features cannot be null") {
        error!(err = %err_msg, "feature catalog outdated — update required");
        return Classification::new(Verdict::Fatal(err_msg.clone()), err_msg, None);
    }

    // Hard rate limit: the reset header is an absolute epoch.
    if rate.remaining == 0 && rate.reset > 0 {
        debug!(username, reset = rate.reset, "rate limited");
        return Classification::new(
            Verdict::Retry(Release::Until(rate.reset)),
            err_msg,
            Some("normal_rate_limit"),
        );
    }

    // Error 88 with remaining quota is a possible ban signal, not a normal
    // window exhaustion. Graduated backoff per strike.
    if err_msg.starts_with("(88) Rate limit exceeded") && rate.remaining > 0 {
        let verdict = ban_strike(username, &err_msg, reputation);
        return Classification::new(verdict, err_msg, Some("error_88_ban"));
    }

    if err_msg.starts_with("(326) Authorization: Denied by access control") {
        warn!(username, err = %err_msg, "ban detected");
        return Classification::new(
            Verdict::Retry(Release::Inactive(Some(err_msg.clone()))),
            err_msg,
            None,
        );
    }

    if err_msg.starts_with("(32) Could not authenticate you") {
        warn!(username, err = %err_msg, "session expired or banned");
        return Classification::new(
            Verdict::Retry(Release::Inactive(Some(err_msg.clone()))),
            err_msg,
            None,
        );
    }

    if err_msg == "OK" && rep.status == 403 {
        warn!(username, "403 with empty body — session expired or banned");
        return Classification::new(Verdict::Retry(Release::Inactive(None)), err_msg, None);
    }

    // Platform-side dependency failure. When the data subtree survived, the
    // payload is still usable; otherwise nothing can be salvaged. Abort the
    // whole call without charging the account.
    if err_msg.starts_with("(131) Dependency: Internal error") {
        let has_user = rep.status == 200
            && rep
                .body
                .get("data")
                .map(|d| d.get("user").is_some())
                .unwrap_or(false);
        if has_user {
            err_msg = "OK".to_string();
        } else {
            warn!(username, err = %err_msg, "dependency error — request skipped");
            return Classification::new(Verdict::Abort, err_msg, None);
        }
    }

    // Deleted or hidden content; upstream finds empty data.
    if rep.status == 200 && err_msg.contains("_Missing: No status found with that ID") {
        return Classification::new(Verdict::Accept, err_msg, None);
    }

    // Transient authorization-worded noise at 200; pass through.
    if rep.status == 200 && err_msg.contains("Authorization") {
        warn!(username, err = %err_msg, "authorization unknown error");
        return Classification::new(Verdict::Accept, err_msg, None);
    }

    if err_msg != "OK" {
        warn!(username, err = %err_msg, "api unknown error");
        let verdict = soft_error(username, &err_msg, reputation);
        return Classification::new(verdict, err_msg, Some("api_unknown_error"));
    }

    // OK path: a success wipes the account's offence history.
    reputation.reset(username);

    if !rep.is_success() {
        error!(status = rep.status, username, "unhandled api response code");
        let until = Utc::now().timestamp() + UNHANDLED_STATUS_LOCK_MINUTES * 60;
        return Classification::new(Verdict::Retry(Release::Until(until)), err_msg, None);
    }

    Classification::new(Verdict::Accept, err_msg, Some("success"))
}

/// Graduated backoff for possible-ban signals. Strike *n* locks for
/// `min(60 * 2^(n-1), 1440 - sum(previous))` minutes, giving the sequence
/// 60, 120, 240, 480, 540; the sixth strike deactivates the account.
fn ban_strike(username: &str, err_msg: &str, reputation: &ReputationBook) -> Verdict {
    let strikes = reputation.incr_ban_strike(username);

    if strikes >= BAN_STRIKE_MAX {
        warn!(username, strikes, "ban strikes exhausted — marking inactive");
        reputation.clear_ban_strikes(username);
        return Verdict::Retry(Release::Inactive(Some(err_msg.to_string())));
    }

    let base = BAN_BACKOFF_BASE_MINUTES << (strikes - 1);
    let cumulative: i64 = (0..strikes - 1)
        .map(|i| BAN_BACKOFF_BASE_MINUTES << i)
        .sum();
    let minutes = base.min(BAN_BACKOFF_CAP_MINUTES - cumulative);
    warn!(
        username,
        strike = strikes,
        max = BAN_STRIKE_MAX,
        backoff_minutes = minutes,
        "ban strike — backing off"
    );
    Verdict::Retry(Release::Until(Utc::now().timestamp() + minutes * 60))
}

/// Soft errors at 200. Timeouts lock immediately without touching the
/// counter; anything else counts toward the consecutive threshold.
fn soft_error(username: &str, err_msg: &str, reputation: &ReputationBook) -> Verdict {
    if err_msg.contains("(29) Timeout") {
        info!(username, minutes = TIMEOUT_LOCK_MINUTES, "timeout error — locking");
        return Verdict::Retry(Release::Until(
            Utc::now().timestamp() + TIMEOUT_LOCK_MINUTES * 60,
        ));
    }

    let count = reputation.incr_soft_error(username);
    if count >= SOFT_ERROR_THRESHOLD {
        warn!(
            username,
            count,
            minutes = SOFT_ERROR_LOCK_MINUTES,
            "consecutive soft errors — locking"
        );
        reputation.clear_soft_errors(username);
        return Verdict::Retry(Release::Until(
            Utc::now().timestamp() + SOFT_ERROR_LOCK_MINUTES * 60,
        ));
    }

    Verdict::Accept
}
