//! Normalised view of one inbound HTTP request.
//!
//! The Listener builds an [`IncomingRequest`] from whatever the transport
//! handed it.  Construction never fails: unknown methods collapse into
//! [`Method::Other`] and bodies that are not JSON become `None`.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Header names mapped to values, in the order they arrived.
pub type Headers = IndexMap<String, String>;

/// Paths that a GET may fetch without being treated as probing.
pub const ALLOW_LISTED_PATHS: [&str; 2] = ["/", "/robots.txt"];

/// HTTP verbs tracked by the classifier.  `Other` catches everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
    Pri,
    Other,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Pri => "PRI",
            Method::Other => "OTHER",
        }
    }
}

impl From<&str> for Method {
    fn from(raw: &str) -> Self {
        match raw {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PRI" => Method::Pri,
            _ => Method::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level fields as received, before normalisation.
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub method: &'a str,
    pub remote_addr: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub local_port: u16,
}

/// One captured request.  Immutable once built; the store persists it as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    /// Remote address of the caller (the actor identity).
    pub address: String,
    pub method: Method,
    pub path: String,
    pub query_string: Option<String>,
    pub headers: Headers,
    pub body: Option<Value>,
    pub local_port: u16,
    /// Server clock at intake.
    pub timestamp: DateTime<Utc>,
}

impl IncomingRequest {
    pub fn from_raw(raw: RawRequest<'_>) -> Self {
        let headers = normalise_headers(raw.headers);
        let body = parse_body(raw.headers, raw.body);
        Self {
            address: raw.remote_addr.to_string(),
            method: Method::from(raw.method),
            path: decode_path(raw.path),
            query_string: raw.query.filter(|q| !q.is_empty()).map(str::to_string),
            headers,
            body,
            local_port: raw.local_port,
            timestamp: Utc::now(),
        }
    }

    /// Benign traffic: a plain GET of the site root or `robots.txt`.
    pub fn is_acceptable(&self) -> bool {
        self.method == Method::Get && ALLOW_LISTED_PATHS.contains(&self.path.as_str())
    }

    /// True when the body carries something beyond an empty container.
    pub fn has_body(&self) -> bool {
        match &self.body {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        crate::util::header_value(&self.headers, "user-agent")
    }
}

/// Percent-decode the path so `/%2eenv` is matched as `/.env`.  Invalid
/// UTF-8 after decoding is replaced lossily.
fn decode_path(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn normalise_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let text = match value.to_str() {
            Ok(s) => s.to_string(),
            Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&text);
            })
            .or_insert(text);
    }
    out
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    let Some(raw) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mime = raw
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

fn parse_body(headers: &HeaderMap, body: &[u8]) -> Option<Value> {
    if body.is_empty() || !is_json_content_type(headers) {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(error = %err, "discarding malformed JSON body");
            None
        }
    }
}
