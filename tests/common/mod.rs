//! Shared fixtures: scripted transport + pool builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use aviary::client::transport::{ApiRequest, ApiResponse, RateLimit};
use aviary::token::SeededTxIdFactory;
use aviary::{
    Account, AccountsPool, ClientEnv, Storage, TokenSource, Transport, TransportError,
    TransportFactory,
};

/// One scripted step: a canned reply or a transport failure.
pub enum Scripted {
    Reply {
        status: u16,
        body: Value,
        remaining: i64,
        reset: i64,
    },
    ReadTimeout,
    Connect,
    Proxy,
    Unknown,
}

impl Scripted {
    pub fn ok(body: Value) -> Self {
        Scripted::Reply {
            status: 200,
            body,
            remaining: 50,
            reset: 0,
        }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Scripted::Reply {
            status,
            body,
            remaining: 50,
            reset: 0,
        }
    }

    pub fn errors(code: i64, message: &str, remaining: i64) -> Self {
        Scripted::Reply {
            status: 200,
            body: json!({"errors": [{"code": code, "message": message}]}),
            remaining,
            reset: 0,
        }
    }

    pub fn rate_limited(reset: i64) -> Self {
        Scripted::Reply {
            status: 429,
            body: json!({}),
            remaining: 0,
            reset,
        }
    }
}

/// Pops scripted steps in order, regardless of which account's transport
/// issues the call. Records every request and the accounts transports were
/// built for.
pub struct ScriptedFactory {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    pub sent: Arc<Mutex<Vec<ApiRequest>>>,
    pub built_for: Arc<Mutex<Vec<String>>>,
    pub sends: Arc<AtomicU32>,
}

impl ScriptedFactory {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            sent: Arc::new(Mutex::new(Vec::new())),
            built_for: Arc::new(Mutex::new(Vec::new())),
            sends: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.sent.lock().unwrap().clone()
    }
}

struct ScriptedTransport {
    username: String,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    sent: Arc<Mutex<Vec<ApiRequest>>>,
    sends: Arc<AtomicU32>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(req.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("transport script exhausted at {}", req.url));

        match step {
            Scripted::Reply {
                status,
                body,
                remaining,
                reset,
            } => {
                let mut headers = HashMap::new();
                headers.insert("x-rate-limit-remaining".to_string(), remaining.to_string());
                headers.insert("x-rate-limit-reset".to_string(), reset.to_string());
                headers.insert("x-rate-limit-limit".to_string(), "50".to_string());
                Ok(ApiResponse {
                    status,
                    method: req.method.clone(),
                    url: req.url.clone(),
                    username: self.username.clone(),
                    rate: RateLimit {
                        remaining,
                        reset,
                        limit: 50,
                    },
                    headers,
                    body,
                })
            }
            Scripted::ReadTimeout => Err(TransportError::ReadTimeout),
            Scripted::Connect => Err(TransportError::Connect("connection refused".to_string())),
            Scripted::Proxy => Err(TransportError::Proxy("proxy unreachable".to_string())),
            Scripted::Unknown => Err(TransportError::Other("mystery failure".to_string())),
        }
    }
}

impl TransportFactory for ScriptedFactory {
    fn build(
        &self,
        account: &Account,
        _proxy: Option<&str>,
    ) -> anyhow::Result<Box<dyn Transport>> {
        self.built_for.lock().unwrap().push(account.username.clone());
        Ok(Box::new(ScriptedTransport {
            username: account.username.clone(),
            script: Arc::clone(&self.script),
            sent: Arc::clone(&self.sent),
            sends: Arc::clone(&self.sends),
        }))
    }
}

pub async fn pool_with(usernames: &[&str], raise_when_no_account: bool) -> AccountsPool {
    let store = Storage::in_memory().await.unwrap();
    for u in usernames {
        store.add(&Account::new(*u, "tok")).await.unwrap();
    }
    AccountsPool::new(store, raise_when_no_account)
}

pub fn env_with(factory: Arc<ScriptedFactory>) -> ClientEnv {
    ClientEnv {
        tokens: Arc::new(TokenSource::new(Arc::new(SeededTxIdFactory::new([0; 32])))),
        transports: factory,
        rate_log: None,
        dump: None,
        proxy: None,
    }
}
