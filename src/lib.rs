//! Resilient multi-account scraping scheduler.
//!
//! Owns a fleet of authenticated identities, allocates them fairly across
//! per-endpoint queues, enforces per-(account, queue) rate-limit windows,
//! classifies the platform's soft- and hard-failure signals, and exposes a
//! single request primitive plus a cursor paginator. Callers see a parsed
//! response or `None`; account rotation, penalties, and retries stay
//! invisible.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod json;
pub mod pool;
pub mod rate_log;
pub mod store;
pub mod token;

pub use api::timeline::{CursorType, Page, TimelineOpts, TimelinePaginator};
pub use api::{ops, Api, Operation};
pub use client::classify::{Release, Verdict};
pub use client::transport::{ApiRequest, ApiResponse, RateLimit, Transport, TransportFactory};
pub use client::{ClientEnv, QueueClient};
pub use config::PoolConfig;
pub use error::{SendError, StaleCatalog, TransportError};
pub use pool::{reputation::ReputationBook, AccountsPool, Borrow};
pub use store::{Account, NextAvailable, Storage};
pub use token::{TokenSource, TransactionIdFactory, TransactionIdGen};
