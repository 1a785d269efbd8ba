//! Process-local reputation counters.
//!
//! Two maps keyed by username: consecutive soft errors and ban strikes.
//! Created lazily on first offence, deleted on any success. Nothing here is
//! persisted: accounts start fresh on restart.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ReputationBook {
    soft_errors: Mutex<HashMap<String, u32>>,
    ban_strikes: Mutex<HashMap<String, u32>>,
}

impl ReputationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-and-add the consecutive soft-error count; returns the new value.
    pub fn incr_soft_error(&self, username: &str) -> u32 {
        let mut map = self.soft_errors.lock().expect("reputation lock poisoned");
        let count = map.entry(username.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the soft-error count after a threshold lock consumed it.
    pub fn clear_soft_errors(&self, username: &str) {
        self.soft_errors
            .lock()
            .expect("reputation lock poisoned")
            .remove(username);
    }

    /// Fetch-and-add the ban-strike count; returns the new value.
    pub fn incr_ban_strike(&self, username: &str) -> u32 {
        let mut map = self.ban_strikes.lock().expect("reputation lock poisoned");
        let count = map.entry(username.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove the strike counter (strike exhaustion → account inactive).
    pub fn clear_ban_strikes(&self, username: &str) {
        self.ban_strikes
            .lock()
            .expect("reputation lock poisoned")
            .remove(username);
    }

    /// Success path: both counters are deleted for the account.
    pub fn reset(&self, username: &str) {
        self.clear_soft_errors(username);
        self.clear_ban_strikes(username);
    }

    pub fn soft_errors(&self, username: &str) -> u32 {
        self.soft_errors
            .lock()
            .expect("reputation lock poisoned")
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    pub fn ban_strikes(&self, username: &str) -> u32 {
        self.ban_strikes
            .lock()
            .expect("reputation lock poisoned")
            .get(username)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let book = ReputationBook::new();
        assert_eq!(book.incr_soft_error("alice"), 1);
        assert_eq!(book.incr_soft_error("alice"), 2);
        assert_eq!(book.incr_ban_strike("alice"), 1);
        assert_eq!(book.soft_errors("alice"), 2);
        assert_eq!(book.ban_strikes("alice"), 1);
        assert_eq!(book.soft_errors("bob"), 0);
    }

    #[test]
    fn reset_clears_both_and_is_idempotent() {
        let book = ReputationBook::new();
        book.incr_soft_error("alice");
        book.incr_ban_strike("alice");
        book.reset("alice");
        assert_eq!(book.soft_errors("alice"), 0);
        assert_eq!(book.ban_strikes("alice"), 0);
        // Second reset is a no-op.
        book.reset("alice");
        assert_eq!(book.soft_errors("alice"), 0);
    }
}
