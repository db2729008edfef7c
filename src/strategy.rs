//! Response selection.  Given a classified request and a decoy catalog,
//! decide how the connection ends.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::request::IncomingRequest;
use crate::store::{Store, StoreError};
use crate::util::final_segment;

pub const NOT_FOUND_BODY: &str = "404 Not Found";

/// Terminal outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMode {
    /// Allow-listed traffic gets a boring 404.
    AcceptableExit,
    /// Serve the decoy contents verbatim.
    PayloadServe(String),
    /// Hold the connection open with filler.
    Stall,
    GenericReject,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::AcceptableExit => "acceptable_exit",
            ResponseMode::PayloadServe(_) => "payload_serve",
            ResponseMode::Stall => "stall",
            ResponseMode::GenericReject => "generic_reject",
        }
    }
}

/// Source of decoy payloads keyed by file name.
#[async_trait]
pub trait PayloadCatalog: Send + Sync {
    async fn lookup(&self, file_name: &str) -> Result<Option<String>, StoreError>;
}

#[async_trait]
impl PayloadCatalog for Store {
    async fn lookup(&self, file_name: &str) -> Result<Option<String>, StoreError> {
        self.lookup_honeypot(file_name).await
    }
}

#[async_trait]
impl PayloadCatalog for HashMap<String, String> {
    async fn lookup(&self, file_name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(file_name).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseStrategist {
    stall_enabled: bool,
}

impl ResponseStrategist {
    pub fn new(stall_enabled: bool) -> Self {
        Self { stall_enabled }
    }

    pub fn stall_enabled(&self) -> bool {
        self.stall_enabled
    }

    /// Rules are checked in order and the first match wins.
    pub async fn choose<C>(&self, req: &IncomingRequest, catalog: &C) -> ResponseMode
    where
        C: PayloadCatalog + ?Sized,
    {
        if req.is_acceptable() {
            return ResponseMode::AcceptableExit;
        }
        let file_name = final_segment(&req.path);
        if !file_name.is_empty() {
            match catalog.lookup(file_name).await {
                Ok(Some(contents)) => return ResponseMode::PayloadServe(contents),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, file_name, "honeypot lookup failed");
                    return ResponseMode::GenericReject;
                }
            }
        }
        if self.stall_enabled {
            ResponseMode::Stall
        } else {
            ResponseMode::GenericReject
        }
    }
}

pub fn not_found() -> Response {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
}

/// Decoy response: plain text, open CORS and an exact length.
pub fn decoy_response(contents: String) -> Response {
    let len = contents.len();
    let mut res = Response::new(Body::from(contents));
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    res
}
