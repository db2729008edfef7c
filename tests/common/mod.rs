#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tarpit::request::{Headers, IncomingRequest, Method};
use tarpit::{app, build_state, AppConfig, AppState};
use tokio::net::TcpListener;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub fn sqlite_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("tarpit.db").display())
}

/// Config with a throwaway database inside `dir` and stalling disabled.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig {
        database_url: sqlite_url(dir),
        ..AppConfig::default()
    };
    config.stall.enabled = false;
    config
}

pub async fn test_state(config: &AppConfig) -> AppState {
    build_state(config).await.expect("state")
}

/// Serve the app on an ephemeral port with peer addresses attached.
pub async fn spawn_app(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn captured(address: &str, method: Method, path: &str, secs: i64) -> IncomingRequest {
    IncomingRequest {
        address: address.into(),
        method,
        path: path.into(),
        query_string: None,
        headers: Headers::from([("user-agent".to_string(), "curl/8.4.0".to_string())]),
        body: None,
        local_port: 8080,
        timestamp: at(secs),
    }
}
