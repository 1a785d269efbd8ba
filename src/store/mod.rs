//! Durable account store.
//!
//! Persists identities, credentials, cookies, and per-(account, queue)
//! unlock timestamps in a single SQLite file. The pool capped at one
//! connection serializes every write; selection queries are deterministic
//! given identical store state.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{collections::HashMap, path::Path, str::FromStr};

/// One identity record. `cookies` is a serialized JSON object
/// (name → value); the CSRF token lives in the `ct0` cookie.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
    /// Bearer token sent in the `authorization` header.
    pub auth_token: String,
    pub cookies: String,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub active: bool,
    /// RFC-3339; `None` until the account is first borrowed.
    pub last_used: Option<String>,
    /// Last fatal error message, set when the account goes inactive.
    pub error_msg: Option<String>,
}

impl Account {
    /// Minimal record for registration; remaining fields default empty.
    pub fn new(username: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: String::new(),
            email: String::new(),
            password: String::new(),
            auth_token: auth_token.into(),
            cookies: "{}".to_string(),
            user_agent: String::new(),
            proxy: None,
            active: true,
            last_used: None,
            error_msg: None,
        }
    }

    /// Parse the cookie jar into a map. Malformed jars read as empty.
    pub fn cookie_map(&self) -> HashMap<String, String> {
        serde_json::from_str::<Value>(&self.cookies)
            .ok()
            .and_then(|v| {
                v.as_object().map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// CSRF token (`ct0` cookie), empty when the jar has none.
    pub fn csrf_token(&self) -> String {
        self.cookie_map().get("ct0").cloned().unwrap_or_default()
    }
}

/// Outcome of a next-available query for one queue.
#[derive(Debug)]
pub enum NextAvailable {
    /// An active, unlocked account is ready now.
    Ready(Box<Account>),
    /// All eligible accounts are locked; earliest future unlock (epoch secs).
    WaitUntil(i64),
    /// No active account can ever serve this queue.
    NoAccounts,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        // Single connection: all writes are serialized through it.
        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Same schema, same single-writer discipline.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Accounts ────────────────────────────────────────────────────────────

    /// Upsert by username.
    pub async fn add(&self, acc: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts
               (username, display_name, email, password, auth_token, cookies,
                user_agent, proxy, active, last_used, error_msg)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
               display_name = excluded.display_name,
               email = excluded.email,
               password = excluded.password,
               auth_token = excluded.auth_token,
               cookies = excluded.cookies,
               user_agent = excluded.user_agent,
               proxy = excluded.proxy,
               active = excluded.active",
        )
        .bind(&acc.username)
        .bind(&acc.display_name)
        .bind(&acc.email)
        .bind(&acc.password)
        .bind(&acc.auth_token)
        .bind(&acc.cookies)
        .bind(&acc.user_agent)
        .bind(&acc.proxy)
        .bind(acc.active)
        .bind(&acc.last_used)
        .bind(&acc.error_msg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, username: &str) -> Result<Option<Account>> {
        Ok(sqlx::query_as("SELECT * FROM accounts WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn all(&self) -> Result<Vec<Account>> {
        Ok(sqlx::query_as("SELECT * FROM accounts ORDER BY username ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn active(&self) -> Result<Vec<Account>> {
        Ok(
            sqlx::query_as("SELECT * FROM accounts WHERE active = 1 ORDER BY username ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn set_cookies(&self, username: &str, cookies: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET cookies = ? WHERE username = ?")
            .bind(cookies)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip the active flag; `reason` records the last fatal error when
    /// deactivating and is cleared on reactivation.
    pub async fn set_active(&self, username: &str, active: bool, reason: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE accounts SET active = ?, error_msg = ? WHERE username = ?")
            .bind(active)
            .bind(if active { None } else { reason })
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp `last_used`; called when the pool hands the account out.
    pub async fn mark_used(&self, username: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_used = ? WHERE username = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Queue locks ─────────────────────────────────────────────────────────

    /// Advance the unlock timestamp for (username, queue) to at least `ts`
    /// (epoch seconds) and add `inc_req_count` to the cumulative request
    /// counter, atomically. Timestamps only ever move forward; `reset_locks`
    /// is the explicit way back.
    pub async fn lock_until(
        &self,
        username: &str,
        queue: &str,
        ts: i64,
        inc_req_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_locks (username, queue, unlock_at, req_count)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(username, queue) DO UPDATE SET
               unlock_at = MAX(unlock_at, excluded.unlock_at),
               req_count = req_count + excluded.req_count",
        )
        .bind(username)
        .bind(queue)
        .bind(ts)
        .bind(inc_req_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Release as "immediately available": unlock-at moves to now plus a
    /// 0–2 s pseudo-jitter so simultaneous releases don't collide on the
    /// same instant.
    pub async fn unlock(&self, username: &str, queue: &str, inc_req_count: i64) -> Result<()> {
        let ts = Utc::now().timestamp() + jitter_secs(username, queue);
        self.lock_until(username, queue, ts, inc_req_count).await
    }

    /// Clear every lock entry (explicit reset).
    pub async fn reset_locks(&self) -> Result<u64> {
        let n = sqlx::query("DELETE FROM queue_locks")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }

    /// Clear the lock entry for one (username, queue).
    pub async fn reset_lock(&self, username: &str, queue: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_locks WHERE username = ? AND queue = ?")
            .bind(username)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unlock_at(&self, username: &str, queue: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT unlock_at FROM queue_locks WHERE username = ? AND queue = ?")
                .bind(username)
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(t,)| t).unwrap_or(0))
    }

    pub async fn req_count(&self, username: &str, queue: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT req_count FROM queue_locks WHERE username = ? AND queue = ?")
                .bind(username)
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }

    // ─── Selection ───────────────────────────────────────────────────────────

    /// Pick the account that should serve `queue` next, skipping usernames
    /// in `exclude` (in-process borrows held by the lock manager).
    ///
    /// Active accounts are ordered by (unlock-at ascending, last-used
    /// ascending): accounts never locked for this queue sort first, and
    /// least-recently-used wins ties. If every candidate is still locked,
    /// the earliest future unlock is returned so the caller can sleep until
    /// then.
    pub async fn next_available(&self, queue: &str, exclude: &[String]) -> Result<NextAvailable> {
        #[derive(sqlx::FromRow)]
        struct CandidateRow {
            #[sqlx(flatten)]
            account: Account,
            unlock_at: i64,
        }

        let candidates: Vec<CandidateRow> = sqlx::query_as(
            "SELECT a.*, COALESCE(q.unlock_at, 0) AS unlock_at FROM accounts a
             LEFT JOIN queue_locks q ON q.username = a.username AND q.queue = ?1
             WHERE a.active = 1
             ORDER BY COALESCE(q.unlock_at, 0) ASC, COALESCE(a.last_used, '') ASC",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        if candidates.is_empty() {
            return Ok(NextAvailable::NoAccounts);
        }

        let now = Utc::now().timestamp();
        let mut earliest: Option<i64> = None;
        for CandidateRow { account, unlock_at } in candidates {
            if exclude.contains(&account.username) {
                continue;
            }
            if unlock_at <= now {
                return Ok(NextAvailable::Ready(Box::new(account)));
            }
            earliest = Some(earliest.map_or(unlock_at, |e| e.min(unlock_at)));
        }

        match earliest {
            Some(at) => Ok(NextAvailable::WaitUntil(at)),
            // Every active account is borrowed right now; nothing timed to
            // wait for; the caller waits on a release notification.
            None => Ok(NextAvailable::WaitUntil(now + 1)),
        }
    }
}

/// 0–2 s deterministic pseudo-jitter (LCG, Numerical Recipes parameters).
/// Avoids a `rand` dependency for a spread this small.
fn jitter_secs(username: &str, queue: &str) -> i64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    let seed = username
        .bytes()
        .chain(queue.bytes())
        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
    (A.wrapping_mul(seed).wrapping_add(C) % 3) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(usernames: &[&str]) -> Storage {
        let store = Storage::in_memory().await.unwrap();
        for u in usernames {
            store.add(&Account::new(*u, "tok")).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn add_is_upsert_by_username() {
        let store = store_with(&["alice"]).await;
        let mut acc = Account::new("alice", "tok2");
        acc.email = "a@example.com".to_string();
        store.add(&acc).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].auth_token, "tok2");
        assert_eq!(all[0].email, "a@example.com");
    }

    #[tokio::test]
    async fn inactive_accounts_are_never_selected() {
        let store = store_with(&["alice", "bob"]).await;
        store.set_active("alice", false, Some("banned")).await.unwrap();

        match store.next_available("SearchTimeline", &[]).await.unwrap() {
            NextAvailable::Ready(acc) => assert_eq!(acc.username, "bob"),
            other => panic!("expected Ready, got {other:?}"),
        }

        store.set_active("bob", false, None).await.unwrap();
        assert!(matches!(
            store.next_available("SearchTimeline", &[]).await.unwrap(),
            NextAvailable::NoAccounts
        ));
    }

    #[tokio::test]
    async fn locked_accounts_wait_until_earliest_unlock() {
        let store = store_with(&["alice", "bob"]).await;
        let now = Utc::now().timestamp();
        store.lock_until("alice", "q", now + 600, 0).await.unwrap();
        store.lock_until("bob", "q", now + 300, 0).await.unwrap();

        match store.next_available("q", &[]).await.unwrap() {
            NextAvailable::WaitUntil(at) => assert_eq!(at, now + 300),
            other => panic!("expected WaitUntil, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lock_is_monotonic_and_counts_requests() {
        let store = store_with(&["alice"]).await;
        store.lock_until("alice", "q", 5_000, 3).await.unwrap();
        // An earlier timestamp never pulls the unlock back.
        store.lock_until("alice", "q", 1_000, 2).await.unwrap();

        assert_eq!(store.unlock_at("alice", "q").await.unwrap(), 5_000);
        assert_eq!(store.req_count("alice", "q").await.unwrap(), 5);

        store.reset_locks().await.unwrap();
        assert_eq!(store.unlock_at("alice", "q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn selection_prefers_least_recently_used() {
        let store = store_with(&["alice", "bob"]).await;
        store.mark_used("bob").await.unwrap();
        // alice has last_used = NULL → sorts first.
        match store.next_available("q", &[]).await.unwrap() {
            NextAvailable::Ready(acc) => assert_eq!(acc.username, "alice"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exclusion_skips_borrowed_accounts() {
        let store = store_with(&["alice", "bob"]).await;
        let borrowed = vec!["alice".to_string()];
        match store.next_available("q", &borrowed).await.unwrap() {
            NextAvailable::Ready(acc) => assert_eq!(acc.username, "bob"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlock_moves_timestamp_near_now() {
        let store = store_with(&["alice"]).await;
        let now = Utc::now().timestamp();
        store.unlock("alice", "q", 1).await.unwrap();
        let at = store.unlock_at("alice", "q").await.unwrap();
        assert!(at >= now && at <= now + 3, "unlock_at {at} not near {now}");
        assert_eq!(store.req_count("alice", "q").await.unwrap(), 1);
    }

    #[test]
    fn csrf_token_reads_ct0_cookie() {
        let mut acc = Account::new("alice", "tok");
        acc.cookies = r#"{"ct0":"csrf-value","auth_token":"aaa"}"#.to_string();
        assert_eq!(acc.csrf_token(), "csrf-value");
        acc.cookies = "not-json".to_string();
        assert_eq!(acc.csrf_token(), "");
    }
}
