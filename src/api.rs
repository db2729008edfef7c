//! Read-only JSON reporting API, mounted under `/api` when enabled.

use std::collections::HashSet;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::store::{MatchMode, SearchQuery, StoreError};
use crate::AppState;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<StoreError> for ErrorResponse {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidFilter(message) => bad_request(message),
            other => {
                tracing::error!(error = %other, "reporting query failed");
                ErrorResponse {
                    error_code: 5000,
                    message: "Internal error".into(),
                    http_status: 500,
                }
            }
        }
    }
}

fn bad_request(message: String) -> ErrorResponse {
    ErrorResponse {
        error_code: 4002,
        message,
        http_status: 400,
    }
}

fn not_found(message: String) -> ErrorResponse {
    ErrorResponse {
        error_code: 4004,
        message,
        http_status: 404,
    }
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse {
        error_code: 2001,
        message: "Unauthorized".into(),
        http_status: 401,
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}

/// With no configured tokens the API is open.
pub fn ensure_authorized(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let Some(tokens) = allowed_tokens else {
        return Ok(());
    };
    let token = extract_bearer_token(headers)?;
    if !tokens.contains(&token) {
        return Err(authorization_error());
    }
    Ok(())
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Err(err) = ensure_authorized(req.headers(), state.api_tokens.as_deref()) {
        return err.into_response();
    }
    next.run(req).await
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/hosts", get(hosts_handler))
        .route("/endpoints", get(endpoints_handler))
        .route("/hosts_by_endpoint", get(hosts_by_endpoint_handler))
        .route("/requests", get(requests_handler))
        .route("/requests/:id", get(request_handler))
        .route("/search", get(search_handler))
        .route("/stats", get(stats_handler))
        .route("/healthz", get(crate::healthz_handler))
        .route("/metrics", get(crate::metrics_handler))
        .route_layer(middleware::from_fn_with_state(state, require_token))
}

type ApiResult<T> = Result<Json<T>, ErrorResponse>;

async fn hosts_handler(State(state): State<AppState>) -> ApiResult<Vec<crate::store::ActorSummary>> {
    Ok(Json(state.store.list_actors_with_stats().await?))
}

async fn endpoints_handler(State(state): State<AppState>) -> ApiResult<Vec<crate::store::EndpointCount>> {
    Ok(Json(state.store.list_endpoints().await?))
}

#[derive(Debug, Deserialize)]
struct EndpointQuery {
    endpoint: Option<String>,
}

async fn hosts_by_endpoint_handler(
    State(state): State<AppState>,
    Query(params): Query<EndpointQuery>,
) -> ApiResult<Vec<crate::store::EndpointHost>> {
    let endpoint = params
        .endpoint
        .filter(|e| !e.is_empty())
        .ok_or_else(|| bad_request("Missing endpoint parameter".into()))?;
    Ok(Json(state.store.hosts_by_endpoint(&endpoint).await?))
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    host: Option<String>,
    endpoint: Option<String>,
}

async fn requests_handler(
    State(state): State<AppState>,
    Query(params): Query<RequestsQuery>,
) -> ApiResult<Vec<crate::store::StoredRequest>> {
    let host = params.host.as_deref().filter(|h| !h.is_empty());
    let endpoint = params.endpoint.as_deref().filter(|e| !e.is_empty());
    Ok(Json(state.store.list_requests(host, endpoint).await?))
}

async fn request_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<crate::store::StoredRequest> {
    match state.store.get_request(id).await? {
        Some(stored) => Ok(Json(stored)),
        None => Err(not_found(format!("Request {id} not found"))),
    }
}

/// Raw search parameters.  Everything arrives as text so empty values can be
/// treated as absent instead of failing deserialisation.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub actor: Option<String>,
    pub uri: Option<String>,
    pub method: Option<String>,
    pub threat_level: Option<String>,
    pub acceptable: Option<String>,
    pub headers: Option<String>,
    pub query_string: Option<String>,
    pub body: Option<String>,
    pub all_must_match: Option<String>,
    pub case_sensitive: Option<String>,
}

fn parse_flag(name: &str, value: Option<&str>) -> Result<Option<bool>, ErrorResponse> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(bad_request(format!("{name} must be a boolean"))),
        },
    }
}

impl SearchParams {
    pub fn into_query(self) -> Result<SearchQuery, ErrorResponse> {
        let threat_level = match self.threat_level.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => None,
            Some(v) => Some(
                v.parse::<u8>()
                    .map_err(|_| bad_request("threat_level must be an integer between 0 and 10".into()))?,
            ),
        };
        let acceptable = parse_flag("acceptable", self.acceptable.as_deref())?;
        let all_must_match = parse_flag("all_must_match", self.all_must_match.as_deref())?.unwrap_or(false);
        let case_sensitive = parse_flag("case_sensitive", self.case_sensitive.as_deref())?.unwrap_or(false);
        Ok(SearchQuery {
            actor: self.actor,
            uri: self.uri,
            method: self.method,
            threat_level,
            acceptable,
            headers: self.headers,
            query_string: self.query_string,
            body: self.body,
            match_mode: if all_must_match { MatchMode::All } else { MatchMode::Any },
            case_sensitive,
        })
    }
}

async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<crate::store::StoredRequest>> {
    let query = params.into_query()?;
    Ok(Json(state.store.search(&query).await?))
}

async fn stats_handler(State(state): State<AppState>) -> ApiResult<crate::store::Stats> {
    Ok(Json(state.store.stats().await?))
}
