//! Aggregate figures over the whole capture history.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{micros_to_datetime, Result, RequestRow, Store, StoredRequest, SELECT_REQUESTS};

/// A request to a path that nobody else ever asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueEndpoint {
    pub method: String,
    pub path: String,
    pub threat_level: i64,
}

/// The most recently created actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastActor {
    pub address: String,
    /// Time of its newest request; `None` if it has none.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_requests: i64,
    pub total_actors: i64,
    pub distinct_endpoints: i64,
    pub last_request: Option<StoredRequest>,
    /// Most recent request whose path has been seen exactly once.
    pub unique_endpoint: Option<UniqueEndpoint>,
    /// Mean gap between consecutive requests.  `None` below two requests.
    pub mean_inter_arrival_secs: Option<f64>,
    pub since_last_secs: Option<f64>,
    pub last_actor: Option<LastActor>,
}

fn micros_to_secs(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

impl Store {
    pub async fn stats(&self) -> Result<Stats> {
        let (total_requests, first, last): (i64, Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM requests")
                .fetch_one(self.pool())
                .await?;
        let total_actors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actors")
            .fetch_one(self.pool())
            .await?;
        let distinct_endpoints: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT path) FROM requests")
            .fetch_one(self.pool())
            .await?;

        let last_row: Option<RequestRow> = sqlx::query_as(&format!(
            "{SELECT_REQUESTS} ORDER BY r.timestamp DESC, r.id DESC LIMIT 1"
        ))
        .fetch_optional(self.pool())
        .await?;
        let last_request = last_row.map(StoredRequest::try_from).transpose()?;

        let unique: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT r.method, r.path, r.threat_level FROM requests r \
             JOIN (SELECT path, MAX(id) AS id FROM requests GROUP BY path HAVING COUNT(*) = 1) u \
               ON u.id = r.id \
             ORDER BY r.timestamp DESC, r.id DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        let unique_endpoint = unique.map(|(method, path, threat_level)| UniqueEndpoint {
            method,
            path,
            threat_level,
        });

        let mean_inter_arrival_secs = match (first, last) {
            (Some(first), Some(last)) if total_requests > 1 => {
                Some(micros_to_secs(last - first) / (total_requests - 1) as f64)
            }
            _ => None,
        };
        let since_last_secs =
            last.map(|last| micros_to_secs(Utc::now().timestamp_micros() - last).max(0.0));

        let newest_actor: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT a.address, (SELECT MAX(r.timestamp) FROM requests r WHERE r.actor_id = a.id) \
             FROM actors a ORDER BY a.id DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        let last_actor = match newest_actor {
            Some((address, last_seen)) => Some(LastActor {
                address,
                last_seen: last_seen.map(micros_to_datetime).transpose()?,
            }),
            None => None,
        };

        Ok(Stats {
            total_requests,
            total_actors,
            distinct_endpoints,
            last_request,
            unique_endpoint,
            mean_inter_arrival_secs,
            since_last_secs,
            last_actor,
        })
    }
}
