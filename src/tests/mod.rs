//! API-level and cross-module tests.
//!
//! ## Test Modules
//!
//! - **governor_api_tests**: Token issuance, throttling and CSRF submission through the router
//! - **error_tests**: Error responses and the fault verdict table
//! - **config_tests**: Configuration loading and validation
//! - **health_api_tests**: Health, metrics and version endpoints
//!
//! Individual test modules can be run with:
//! ```bash
//! cargo test governor_api_tests
//! ```


use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{Request, Response},
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::clock::ManualClock;
use crate::config::AppConfig;
use crate::state::AppState;
use crate::store::{KvStore, StoreError, StoreResult};

pub(crate) fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// State on a manual clock with the default configuration.
pub(crate) fn test_state() -> (AppState, Arc<ManualClock>) {
    test_state_with(AppConfig::default())
}

pub(crate) fn test_state_with(config: AppConfig) -> (AppState, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start()));
    (AppState::with_clock(config, clock.clone()), clock)
}

/// A request as it arrives from `peer` through `into_make_service_with_connect_info`.
pub(crate) fn request_from(peer: &str) -> axum::http::request::Builder {
    let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
    Request::builder().extension(ConnectInfo(addr))
}

pub(crate) async fn body_json(res: Response<Body>) -> serde_json::Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub(crate) async fn body_text(res: Response<Body>) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// A store whose every operation fails.
pub(crate) struct BrokenStore;

#[async_trait]
impl<V> KvStore<V> for BrokenStore
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, _key: &str) -> StoreResult<Option<V>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: V) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn sweep(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn len(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
