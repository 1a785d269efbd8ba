//! In-process account arbitration over the durable store.
//!
//! The store's unlock-at timestamp is the *persistent* gate; the borrow set
//! here is the *live* gate. Both must pass before an account is handed out
//! for a queue. Waiters park on a `Notify` plus a timed sleep bounded by
//! the earliest future unlock, whichever fires first.

pub mod reputation;

use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::store::{Account, NextAvailable, Storage};
use reputation::ReputationBook;

/// Poll bound while the store has no active accounts at all.
const EMPTY_POOL_POLL: Duration = Duration::from_secs(5);

struct PoolInner {
    store: Storage,
    /// Live borrows: (username, queue). Guarded by a std mutex, never held
    /// across an await.
    borrows: Mutex<HashSet<(String, String)>>,
    notify: Notify,
    raise_when_no_account: bool,
    reputation: ReputationBook,
}

impl PoolInner {
    fn free(&self, username: &str, queue: &str) {
        self.borrows
            .lock()
            .expect("borrow set poisoned")
            .remove(&(username.to_string(), queue.to_string()));
        self.notify.notify_waiters();
    }
}

/// Exclusive in-memory reservation of one account for one queue.
///
/// Consumed by an explicit release (`release`, `release_until`,
/// `release_inactive`). If dropped instead (caller cancelled at an await
/// point, or an error unwound past it), the borrow is freed synchronously
/// and the persistent unlock is spawned best-effort with no penalty and no
/// request charge.
pub struct Borrow {
    inner: Arc<PoolInner>,
    pub account: Account,
    queue: String,
    released: bool,
}

impl Borrow {
    pub fn username(&self) -> &str {
        &self.account.username
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Release as immediately available, charging `req_count` successful
    /// requests to the (account, queue) counter.
    pub async fn release(mut self, req_count: i64) -> Result<()> {
        self.released = true;
        let (user, queue) = (self.account.username.clone(), self.queue.clone());
        self.inner.store.unlock(&user, &queue, req_count).await?;
        self.inner.free(&user, &queue);
        debug!(username = %user, queue = %queue, req_count, "account released");
        Ok(())
    }

    /// Release with a penalty lock: the account stays unavailable for this
    /// queue until `unlock_at` (epoch seconds).
    pub async fn release_until(mut self, unlock_at: i64, req_count: i64) -> Result<()> {
        self.released = true;
        let (user, queue) = (self.account.username.clone(), self.queue.clone());
        self.inner
            .store
            .lock_until(&user, &queue, unlock_at, req_count)
            .await?;
        self.inner.free(&user, &queue);
        debug!(username = %user, queue = %queue, unlock_at, "account locked");
        Ok(())
    }

    /// Release and durably deactivate the account.
    pub async fn release_inactive(mut self, msg: Option<&str>) -> Result<()> {
        self.released = true;
        let (user, queue) = (self.account.username.clone(), self.queue.clone());
        self.inner.store.set_active(&user, false, msg).await?;
        self.inner.free(&user, &queue);
        warn!(username = %user, queue = %queue, reason = msg.unwrap_or("-"), "account marked inactive");
        Ok(())
    }
}

impl Drop for Borrow {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let user = self.account.username.clone();
        let queue = self.queue.clone();
        self.inner.free(&user, &queue);
        // Persist the unlock off-path; on a dead runtime the borrow set and
        // notify above are still correct and the store entry stays as-is.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.inner.store.clone();
            handle.spawn(async move {
                if let Err(e) = store.unlock(&user, &queue, 0).await {
                    warn!(err = %e, "unlock on drop failed");
                }
            });
        }
    }
}

/// The account pool: fair allocation of stored accounts across queues.
#[derive(Clone)]
pub struct AccountsPool {
    inner: Arc<PoolInner>,
}

impl AccountsPool {
    pub fn new(store: Storage, raise_when_no_account: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                borrows: Mutex::new(HashSet::new()),
                notify: Notify::new(),
                raise_when_no_account,
                reputation: ReputationBook::new(),
            }),
        }
    }

    pub fn store(&self) -> &Storage {
        &self.inner.store
    }

    pub fn reputation(&self) -> &ReputationBook {
        &self.inner.reputation
    }

    /// Borrow an account for `queue`, waiting until one is active, not
    /// borrowed in-process, and past its unlock-at.
    ///
    /// With `raise_when_no_account` set the pool never waits: `Ok(None)`
    /// comes back as soon as nothing is ready. Otherwise the wait is
    /// unbounded. Waits are cancellable: no borrow is held until one is
    /// returned.
    pub async fn get_for_queue_or_wait(&self, queue: &str) -> Result<Option<Borrow>> {
        loop {
            // Register for release notifications before inspecting the store
            // so a release between the query and the wait is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            let exclude: Vec<String> = {
                let borrows = self.inner.borrows.lock().expect("borrow set poisoned");
                borrows
                    .iter()
                    .filter(|(_, q)| q == queue)
                    .map(|(u, _)| u.clone())
                    .collect()
            };

            let wait = match self.inner.store.next_available(queue, &exclude).await? {
                NextAvailable::Ready(acc) => {
                    let key = (acc.username.clone(), queue.to_string());
                    let claimed = self
                        .inner
                        .borrows
                        .lock()
                        .expect("borrow set poisoned")
                        .insert(key);
                    if !claimed {
                        // Another task reserved it between query and claim.
                        continue;
                    }
                    // Guard first: if the last-used stamp fails, the drop
                    // frees the claim we just made.
                    let borrow = Borrow {
                        inner: Arc::clone(&self.inner),
                        account: *acc,
                        queue: queue.to_string(),
                        released: false,
                    };
                    self.inner.store.mark_used(borrow.username()).await?;
                    debug!(username = %borrow.username(), queue, "account borrowed");
                    return Ok(Some(borrow));
                }
                NextAvailable::WaitUntil(at) => {
                    if self.inner.raise_when_no_account {
                        warn!(queue, unlock_at = at, "no account ready for queue");
                        return Ok(None);
                    }
                    // Bounded re-check; a release wakes waiters sooner via
                    // the notify.
                    let secs = (at - Utc::now().timestamp()).max(0) as u64;
                    Duration::from_secs(secs.clamp(1, 60))
                }
                NextAvailable::NoAccounts => {
                    if self.inner.raise_when_no_account {
                        warn!(queue, "no active account can serve this queue");
                        return Ok(None);
                    }
                    debug!(queue, "pool empty — waiting for accounts");
                    EMPTY_POOL_POLL
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Durably deactivate an account and free any live borrow it holds, on
    /// any queue.
    pub async fn mark_inactive(&self, username: &str, msg: Option<&str>) -> Result<()> {
        self.inner.store.set_active(username, false, msg).await?;
        {
            let mut borrows = self.inner.borrows.lock().expect("borrow set poisoned");
            borrows.retain(|(u, _)| u != username);
        }
        self.inner.notify.notify_waiters();
        warn!(username, reason = msg.unwrap_or("-"), "account marked inactive");
        Ok(())
    }

    /// True if a live borrow exists for (username, queue). Test hook.
    pub fn is_borrowed(&self, username: &str, queue: &str) -> bool {
        self.inner
            .borrows
            .lock()
            .expect("borrow set poisoned")
            .contains(&(username.to_string(), queue.to_string()))
    }
}
