//! Relational store for actors, captured requests and the honeypot catalog.
//!
//! `Store` owns a SQLite connection pool for its whole lifetime and exposes
//! the write path used by the Listener plus the read and aggregation queries
//! used for reporting.  Every value that originates from a request is passed
//! to SQLite as a bound parameter.
//!
//! Recording a request is three independent commits on one connection: the
//! actor row, the request row, then the actor's threat level.  A failure
//! after the first commit leaves an actor with no requests; reporting shows
//! it with a total of zero.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::request::{Headers, IncomingRequest, Method};
use crate::scoring::{ThreatClassifier, MAX_THREAT_LEVEL};

pub mod search;
pub mod stats;

pub use search::{MatchMode, SearchQuery};
pub use stats::Stats;

use search::{Column, FilterSet};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored JSON could not be decoded: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid search filter: {0}")]
    InvalidFilter(String),
    #[error("stored timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActorId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: ActorId,
    pub address: String,
    pub flagged: bool,
    pub threat_level: u8,
}

/// Per-actor request counts, ordered by `total` when listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActorSummary {
    pub address: String,
    pub flagged: bool,
    pub valid: i64,
    pub invalid: i64,
    pub total: i64,
    pub threat_level: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct EndpointCount {
    pub path: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHost {
    pub address: String,
    pub threat_level: i64,
    pub count: i64,
}

/// Identity of a freshly recorded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub request_id: i64,
    pub actor_id: ActorId,
    /// The actor's refreshed average, `None` if the refresh failed after
    /// the request row was committed.
    pub actor_threat_level: Option<u8>,
}

/// A request read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequest {
    pub id: i64,
    pub acceptable: bool,
    pub threat_level: u8,
    #[serde(flatten)]
    pub request: IncomingRequest,
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    address: String,
    timestamp: i64,
    method: String,
    path: String,
    body: Option<String>,
    headers: String,
    query_string: Option<String>,
    port: i64,
    acceptable: bool,
    threat_level: i64,
}

impl TryFrom<RequestRow> for StoredRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self> {
        let timestamp = micros_to_datetime(row.timestamp)?;
        let headers: Headers = serde_json::from_str(&row.headers)?;
        let body = match row.body.as_deref() {
            Some(text) => serde_json::from_str(text)?,
            None => None,
        };
        Ok(StoredRequest {
            id: row.id,
            acceptable: row.acceptable,
            threat_level: clamp_level(row.threat_level),
            request: IncomingRequest {
                address: row.address,
                method: Method::from(row.method.as_str()),
                path: row.path,
                query_string: row.query_string,
                headers,
                body,
                local_port: u16::try_from(row.port).unwrap_or(0),
                timestamp,
            },
        })
    }
}

const SELECT_REQUESTS: &str = "SELECT r.id, a.address, r.timestamp, r.method, r.path, r.body, \
     r.headers, r.query_string, r.port, r.acceptable, r.threat_level \
     FROM requests r JOIN actors a ON a.id = r.actor_id";

const ORDER_NEWEST_FIRST: &str = " ORDER BY r.timestamp DESC, r.id DESC";

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or(StoreError::InvalidTimestamp(micros))
}

async fn ensure_actor_on(conn: &mut SqliteConnection, address: &str) -> Result<ActorId> {
    sqlx::query("INSERT OR IGNORE INTO actors (address, flagged, threat_level) VALUES (?, FALSE, 0)")
        .bind(address)
        .execute(&mut *conn)
        .await?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM actors WHERE address = ?")
        .bind(address)
        .fetch_one(&mut *conn)
        .await?;
    Ok(ActorId(id))
}

async fn actor_level_on(conn: &mut SqliteConnection, actor: ActorId) -> Result<u8> {
    let level: Option<i64> =
        sqlx::query_scalar("SELECT SUM(threat_level) / COUNT(*) FROM requests WHERE actor_id = ?")
            .bind(actor.0)
            .fetch_one(&mut *conn)
            .await?;
    Ok(clamp_level(level.unwrap_or(0)))
}

async fn refresh_actor_level_on(conn: &mut SqliteConnection, actor: ActorId) -> Result<u8> {
    let level = actor_level_on(conn, actor).await?;
    sqlx::query("UPDATE actors SET threat_level = ? WHERE id = ?")
        .bind(i64::from(level))
        .bind(actor.0)
        .execute(&mut *conn)
        .await?;
    Ok(level)
}

fn clamp_level(level: i64) -> u8 {
    level.clamp(0, i64::from(MAX_THREAT_LEVEL)) as u8
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.  Later calls fail with a pool error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- actors -------------------------------------------------------

    /// Create the actor if it does not exist yet and return its id.
    pub async fn ensure_actor(&self, address: &str) -> Result<ActorId> {
        let mut conn = self.pool.acquire().await?;
        ensure_actor_on(&mut conn, address).await
    }

    pub async fn get_actor(&self, address: &str) -> Result<Option<Actor>> {
        let row: Option<(i64, String, bool, i64)> =
            sqlx::query_as("SELECT id, address, flagged, threat_level FROM actors WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, address, flagged, threat_level)| Actor {
            id: ActorId(id),
            address,
            flagged,
            threat_level: clamp_level(threat_level),
        }))
    }

    /// Mark or unmark an actor.  Returns false when the actor is unknown.
    pub async fn set_actor_flagged(&self, address: &str, flagged: bool) -> Result<bool> {
        let done = sqlx::query("UPDATE actors SET flagged = ? WHERE address = ?")
            .bind(flagged)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Floor of the mean score over the actor's requests, 0 when it has none.
    pub async fn actor_threat_level(&self, actor: ActorId) -> Result<u8> {
        let mut conn = self.pool.acquire().await?;
        actor_level_on(&mut conn, actor).await
    }

    /// Recompute and store the actor's average threat level.
    pub async fn refresh_actor_threat_level(&self, actor: ActorId) -> Result<u8> {
        let mut conn = self.pool.acquire().await?;
        refresh_actor_level_on(&mut conn, actor).await
    }

    // ---- requests -----------------------------------------------------

    /// Resolve the actor, insert the request with its score, then refresh
    /// the actor's average.  Each step commits on its own, on the same
    /// connection, so the refresh always sees the new row.
    ///
    /// Errors only when the request row could not be written.  A failed
    /// refresh is logged and reported as `actor_threat_level: None`.
    pub async fn record_request(&self, req: &IncomingRequest, threat_level: u8) -> Result<Recorded> {
        let headers = serde_json::to_string(&req.headers)?;
        let body = req.body.as_ref().map(serde_json::to_string).transpose()?;
        let mut conn = self.pool.acquire().await?;
        let actor_id = ensure_actor_on(&mut conn, &req.address).await?;
        let inserted = sqlx::query(
            "INSERT INTO requests (actor_id, timestamp, method, path, body, headers, query_string, port, acceptable, threat_level) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(actor_id.0)
        .bind(req.timestamp.timestamp_micros())
        .bind(req.method.as_str())
        .bind(&req.path)
        .bind(body)
        .bind(headers)
        .bind(req.query_string.as_deref())
        .bind(i64::from(req.local_port))
        .bind(req.is_acceptable())
        .bind(i64::from(threat_level.min(MAX_THREAT_LEVEL)))
        .execute(&mut *conn)
        .await?;
        let request_id = inserted.last_insert_rowid();
        let actor_threat_level = match refresh_actor_level_on(&mut conn, actor_id).await {
            Ok(level) => Some(level),
            Err(err) => {
                tracing::warn!(actor = %req.address, request_id, error = %err, "failed to refresh actor threat level");
                None
            }
        };
        Ok(Recorded {
            request_id,
            actor_id,
            actor_threat_level,
        })
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<StoredRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!("{SELECT_REQUESTS} WHERE r.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(StoredRequest::try_from).transpose()
    }

    pub async fn update_request_threat_level(&self, id: i64, threat_level: u8) -> Result<bool> {
        let done = sqlx::query("UPDATE requests SET threat_level = ? WHERE id = ?")
            .bind(i64::from(threat_level.min(MAX_THREAT_LEVEL)))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Requests, newest first, optionally restricted to one actor and/or one
    /// exact path.
    pub async fn list_requests(
        &self,
        by_actor: Option<&str>,
        by_endpoint: Option<&str>,
    ) -> Result<Vec<StoredRequest>> {
        let mut filters = FilterSet::new(MatchMode::All);
        if let Some(address) = by_actor {
            filters.equals_text(Column::Actor, address);
        }
        if let Some(path) = by_endpoint {
            filters.equals_text(Column::Path, path);
        }
        self.fetch_filtered(&filters).await
    }

    /// Pattern search over captured requests, newest first.  An empty query
    /// returns everything.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<StoredRequest>> {
        let filters = query.to_filters()?;
        self.fetch_filtered(&filters).await
    }

    async fn fetch_filtered(&self, filters: &FilterSet) -> Result<Vec<StoredRequest>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(SELECT_REQUESTS);
        filters.push_where(&mut qb);
        qb.push(ORDER_NEWEST_FIRST);
        let rows = qb.build_query_as::<RequestRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(StoredRequest::try_from).collect()
    }

    /// Re-classify every stored request and write back changed scores, then
    /// refresh every actor's average.  Returns how many requests changed.
    pub async fn rescore_all(&self, classifier: &ThreatClassifier) -> Result<usize> {
        let mut changed = 0usize;
        for stored in self.list_requests(None, None).await? {
            let level = classifier.classify(&stored.request);
            if level != stored.threat_level {
                self.update_request_threat_level(stored.id, level).await?;
                changed += 1;
            }
        }
        sqlx::query(
            "UPDATE actors SET threat_level = COALESCE( \
                 (SELECT SUM(r.threat_level) / COUNT(*) FROM requests r WHERE r.actor_id = actors.id), 0)",
        )
        .execute(&self.pool)
        .await?;
        tracing::info!(changed, "threat level backfill finished");
        Ok(changed)
    }

    // ---- honeypot catalog ---------------------------------------------

    pub async fn lookup_honeypot(&self, file_name: &str) -> Result<Option<String>> {
        let contents: Option<String> =
            sqlx::query_scalar("SELECT dummy_contents FROM honeypots WHERE file_name = ?")
                .bind(file_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(contents)
    }

    /// Add a decoy.  An existing entry with the same name is left untouched.
    pub async fn insert_honeypot(&self, file_name: &str, contents: &str) -> Result<bool> {
        let done = sqlx::query("INSERT OR IGNORE INTO honeypots (file_name, dummy_contents) VALUES (?, ?)")
            .bind(file_name)
            .bind(contents)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn seed_honeypots(&self, catalog: &BTreeMap<String, String>) -> Result<usize> {
        let mut inserted = 0usize;
        for (file_name, contents) in catalog {
            if self.insert_honeypot(file_name, contents).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    // ---- reporting ----------------------------------------------------

    /// Every actor with valid/invalid/total counts and its on-demand average,
    /// busiest first.
    pub async fn list_actors_with_stats(&self) -> Result<Vec<ActorSummary>> {
        let rows: Vec<ActorSummary> = sqlx::query_as(
            "SELECT a.address AS address, a.flagged AS flagged, \
                 COALESCE(SUM(CASE WHEN r.id IS NOT NULL AND r.acceptable THEN 1 ELSE 0 END), 0) AS valid, \
                 COALESCE(SUM(CASE WHEN r.id IS NOT NULL AND NOT r.acceptable THEN 1 ELSE 0 END), 0) AS invalid, \
                 COUNT(r.id) AS total, \
                 COALESCE(SUM(r.threat_level) / COUNT(r.id), 0) AS threat_level \
             FROM actors a LEFT JOIN requests r ON r.actor_id = a.id \
             GROUP BY a.id \
             ORDER BY total DESC, a.address ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Distinct paths with their hit counts, most requested first.
    pub async fn list_endpoints(&self) -> Result<Vec<EndpointCount>> {
        let rows: Vec<EndpointCount> = sqlx::query_as(
            "SELECT path, COUNT(*) AS count FROM requests GROUP BY path ORDER BY count DESC, path ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Actors that requested `path`, with how often, most active first.
    pub async fn hosts_by_endpoint(&self, path: &str) -> Result<Vec<EndpointHost>> {
        let rows: Vec<EndpointHost> = sqlx::query_as(
            "SELECT a.address AS address, a.threat_level AS threat_level, COUNT(r.id) AS count \
             FROM requests r JOIN actors a ON a.id = r.actor_id \
             WHERE r.path = ? \
             GROUP BY a.id \
             ORDER BY count DESC, a.address ASC",
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
