//! Dynamic filter composition for request queries.
//!
//! Filters accumulate as `(column, operator, value)` triples.  Rendering
//! pushes only fixed column expressions and operators into the SQL text;
//! every value goes through `push_bind`.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use super::StoreError;
use crate::scoring::MAX_THREAT_LEVEL;

/// How the supplied filters combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every filter must match (conjunction).
    All,
    /// At least one filter must match (disjunction).
    #[default]
    Any,
}

impl MatchMode {
    fn separator(self) -> &'static str {
        match self {
            MatchMode::All => " AND ",
            MatchMode::Any => " OR ",
        }
    }
}

/// Searchable columns.  Only these fixed expressions ever reach SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Actor,
    Path,
    Method,
    ThreatLevel,
    Acceptable,
    Headers,
    QueryString,
    Body,
}

impl Column {
    fn sql(self) -> &'static str {
        match self {
            Column::Actor => "a.address",
            Column::Path => "r.path",
            Column::Method => "r.method",
            Column::ThreatLevel => "r.threat_level",
            Column::Acceptable => "r.acceptable",
            Column::Headers => "r.headers",
            Column::QueryString => "r.query_string",
            Column::Body => "r.body",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    /// Substring match.  Case-insensitive matching is ASCII only.
    Contains { case_sensitive: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: Column,
    pub operator: Operator,
    pub value: Value,
}

/// An ordered set of conditions joined by one [`MatchMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    mode: MatchMode,
    conditions: Vec<Condition>,
}

impl FilterSet {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            conditions: Vec::new(),
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn push(&mut self, column: Column, operator: Operator, value: Value) -> &mut Self {
        self.conditions.push(Condition {
            column,
            operator,
            value,
        });
        self
    }

    pub fn equals_text(&mut self, column: Column, value: &str) -> &mut Self {
        self.push(column, Operator::Equals, Value::Text(value.to_string()))
    }

    pub fn contains(&mut self, column: Column, needle: &str, case_sensitive: bool) -> &mut Self {
        self.push(
            column,
            Operator::Contains { case_sensitive },
            Value::Text(needle.to_string()),
        )
    }

    /// Append ` WHERE ...` to `qb`.  Nothing is appended when empty.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if self.conditions.is_empty() {
            return;
        }
        qb.push(" WHERE (");
        for (idx, cond) in self.conditions.iter().enumerate() {
            if idx > 0 {
                qb.push(self.mode.separator());
            }
            push_condition(qb, cond);
        }
        qb.push(")");
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Text(s) => qb.push_bind(s.clone()),
        Value::Int(n) => qb.push_bind(*n),
        Value::Bool(b) => qb.push_bind(*b),
    };
}

fn push_condition(qb: &mut QueryBuilder<'_, Sqlite>, cond: &Condition) {
    let column = cond.column.sql();
    match (cond.operator, &cond.value) {
        (Operator::Contains { case_sensitive: true }, Value::Text(needle)) => {
            qb.push("instr(");
            qb.push(column);
            qb.push(", ");
            qb.push_bind(needle.clone());
            qb.push(") > 0");
        }
        (Operator::Contains { case_sensitive: false }, Value::Text(needle)) => {
            qb.push(column);
            qb.push(" LIKE ");
            qb.push_bind(format!("%{}%", escape_like(needle)));
            qb.push(" ESCAPE '\\'");
        }
        // Substring matching on a non-text value degrades to equality.
        (_, value) => {
            qb.push(column);
            qb.push(" = ");
            push_value(qb, value);
        }
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// User-facing search criteria.  Unset (or empty) fields are left out of the
/// query entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub actor: Option<String>,
    pub uri: Option<String>,
    pub method: Option<String>,
    pub threat_level: Option<u8>,
    pub acceptable: Option<bool>,
    pub headers: Option<String>,
    pub query_string: Option<String>,
    pub body: Option<String>,
    pub match_mode: MatchMode,
    pub case_sensitive: bool,
}

impl SearchQuery {
    pub fn to_filters(&self) -> Result<FilterSet, StoreError> {
        let mut filters = FilterSet::new(self.match_mode);
        let text_filters = [
            (Column::Actor, &self.actor),
            (Column::Path, &self.uri),
            (Column::Method, &self.method),
            (Column::Headers, &self.headers),
            (Column::QueryString, &self.query_string),
            (Column::Body, &self.body),
        ];
        for (column, value) in text_filters {
            if let Some(needle) = value.as_deref().filter(|s| !s.is_empty()) {
                filters.contains(column, needle, self.case_sensitive);
            }
        }
        if let Some(level) = self.threat_level {
            if level > MAX_THREAT_LEVEL {
                return Err(StoreError::InvalidFilter(format!(
                    "threat_level {level} is outside 0..={MAX_THREAT_LEVEL}"
                )));
            }
            filters.push(Column::ThreatLevel, Operator::Equals, Value::Int(i64::from(level)));
        }
        if let Some(acceptable) = self.acceptable {
            filters.push(Column::Acceptable, Operator::Equals, Value::Bool(acceptable));
        }
        Ok(filters)
    }
}
