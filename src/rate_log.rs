//! Rate-limit event stream and debug response dump.
//!
//! Every classified rate event appends one JSON line to a per-day file
//! under the data directory; successes are sampled to keep the volume
//! down. Write failures are logged at WARN and never propagated: a broken
//! log must not interrupt the request pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use crate::client::transport::ApiResponse;

/// Always log a success when the remaining window is this low; otherwise
/// sample one in [`SUCCESS_SAMPLE`].
const LOW_REMAINING: i64 = 20;
const SUCCESS_SAMPLE: u64 = 20;

// ─── Entry ────────────────────────────────────────────────────────────────────

/// One structured JSON line, `camelCase` for easy `jq` querying.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateEvent {
    pub timestamp: String,
    /// `"normal_rate_limit"` | `"error_88_ban"` | `"api_unknown_error"` | `"success"`.
    pub event_type: String,
    pub account: String,
    pub status_code: u16,
    /// Queue (operation name) extracted from the URL.
    pub endpoint: String,
    pub url: String,
    pub error_message_formatted: String,
    /// Raw `errors` array from the body, empty when absent.
    pub raw_errors: Value,
    pub rate_limit_headers: RateHeaders,
}

#[derive(Debug, Serialize)]
pub struct RateHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

impl RateEvent {
    pub fn from_response(rep: &ApiResponse, event_type: &str, err_msg: &str) -> Self {
        let endpoint = rep
            .url
            .split("/graphql/")
            .nth(1)
            .and_then(|rest| rest.split('/').nth(1))
            .map(|name| name.split('?').next().unwrap_or(name).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            account: rep.username.clone(),
            status_code: rep.status,
            endpoint,
            url: rep.url.clone(),
            error_message_formatted: err_msg.to_string(),
            raw_errors: rep
                .body
                .get("errors")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
            rate_limit_headers: RateHeaders {
                limit: rep.rate.limit,
                remaining: rep.rate.remaining,
                reset: rep.rate.reset,
            },
        }
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// Append-only JSONL log, one file per day
/// (`{dir}/rate_limits_YYYYMMDD.jsonl`).
pub struct RateLimitLog {
    dir: PathBuf,
    /// (open handle, day stamp it was opened for); reopened on day change.
    file: Mutex<Option<(tokio::fs::File, String)>>,
    success_seq: AtomicU64,
}

impl RateLimitLog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            file: Mutex::new(None),
            success_seq: AtomicU64::new(0),
        }
    }

    /// Whether this success is worth a line: always when the window is
    /// nearly exhausted, otherwise one in twenty.
    pub fn should_log_success(&self, remaining: i64) -> bool {
        if (0..LOW_REMAINING).contains(&remaining) {
            return true;
        }
        self.success_seq.fetch_add(1, Ordering::Relaxed) % SUCCESS_SAMPLE == 0
    }

    pub async fn append(&self, event: &RateEvent) {
        if let Err(e) = self.try_append(event).await {
            warn!(err = %e, "rate-limit log write failed");
        }
    }

    async fn try_append(&self, event: &RateEvent) -> Result<()> {
        let line = serde_json::to_string(event)? + "\n";
        let day = Utc::now().format("%Y%m%d").to_string();

        let mut guard = self.file.lock().await;
        let stale = guard.as_ref().map(|(_, d)| d != &day).unwrap_or(true);
        if stale {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(format!("rate_limits_{day}.jsonl"));
            let f = OpenOptions::new().create(true).append(true).open(&path).await?;
            *guard = Some((f, day));
        }
        if let Some((f, _)) = guard.as_mut() {
            f.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }
}

// ─── Debug dump ───────────────────────────────────────────────────────────────

/// Process-start stamp used in the dump directory name.
static DUMP_STAMP: Lazy<String> =
    Lazy::new(|| Utc::now().format("%Y-%m-%d_%H-%M").to_string());

/// Debug mode: every response written to one file under a per-process temp
/// directory, numbered in arrival order.
pub struct ResponseDump {
    dir: PathBuf,
    seq: AtomicU64,
}

impl ResponseDump {
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir().join(format!("aviary-{}", *DUMP_STAMP)),
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub async fn write(&self, rep: &ApiResponse) {
        if let Err(e) = self.try_write(rep).await {
            warn!(err = %e, "response dump failed");
        }
    }

    async fn try_write(&self, rep: &ApiResponse) -> Result<()> {
        let count = self.seq.fetch_add(1, Ordering::Relaxed);
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!("{count:05}_{}_{}.txt", rep.status, rep.username);

        let mut headers: Vec<String> = rep
            .headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        headers.sort();

        let text = format!(
            "{count} - {}/{} - {}\n{} {} {}\n\n{}\n\n{}\n",
            rep.rate.remaining,
            rep.rate.limit,
            rep.username,
            rep.status,
            rep.method,
            rep.url,
            headers.join("\n"),
            serde_json::to_string_pretty(&rep.body)?,
        );
        tokio::fs::write(self.dir.join(name), text).await?;
        Ok(())
    }
}

impl Default for ResponseDump {
    fn default() -> Self {
        Self::new()
    }
}
