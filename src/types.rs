use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Bundled example expressions, as `(label, expression)`.
pub const EXAMPLE_QUERIES: [(&str, &str); 4] = [
    ("Scan Employees", "{scan, employees}"),
    ("Scan Departments", "{scan, departments}"),
    ("Take 25 Naturals", "{take, {scan, naturals}, 25}"),
    (
        "Join Example",
        "{join, {scan, employees}, {scan, departments}, dept_id}",
    ),
];

/// Opaque identity of one submitted query's result record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ResultId(pub(crate) u64);

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of the engine's single stream connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Preparing,
    Ready,
    Waiting(String),
    Failed(String),
    Cancelled,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Human-readable error published for this transition, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Waiting(reason) => Some(format!("Waiting to connect: {reason}")),
            Self::Failed(reason) => Some(format!("Connection failed: {reason}")),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Preparing => f.write_str("preparing"),
            Self::Ready => f.write_str("ready"),
            Self::Waiting(reason) => write!(f, "waiting ({reason})"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Accumulated rows of one query.
///
/// Every row has exactly `columns.len()` cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelationTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RelationTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Tab-separated rendering: a header line, then one line per row.
    pub fn to_tsv(&self) -> String {
        let mut out = self.columns.join("\t");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }

    /// Name-based view over row `index`.
    #[cfg(feature = "row-map")]
    pub fn row(&self, index: usize) -> Option<crate::row_map::RowRef<'_>> {
        self.rows.get(index).map(|values| crate::row_map::RowRef {
            columns: &self.columns,
            values,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchemaAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchemaConstraint {
    pub attribute: String,
    pub constraint: String,
}

/// One relation as listed by `SCHEMA`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelationSchema {
    pub name: String,
    pub cardinality: String,
    pub attributes: Vec<SchemaAttribute>,
    pub constraints: Vec<SchemaConstraint>,
    pub provenance: Option<String>,
}

impl RelationSchema {
    /// Expression scanning this relation.
    pub fn scan_query(&self) -> String {
        format!("{{scan, {}}}", self.name)
    }
}

/// Result record of one submitted query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub id: ResultId,
    pub query: String,
    pub session_id: Option<String>,
    pub table: Option<RelationTable>,
    pub has_more_rows: bool,
    pub is_loading: bool,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    /// Time from submission to the first successful batch.
    pub execution_time: Option<Duration>,
}

impl QueryResult {
    pub(crate) fn new(id: ResultId, query: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            session_id: None,
            table: None,
            has_more_rows: false,
            is_loading: false,
            error_message: None,
            started_at: None,
            execution_time: None,
        }
    }
}

/// Observable engine state, published after every change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub is_connected: bool,
    pub is_loading: bool,
    pub error_message: Option<String>,
    pub results: Vec<QueryResult>,
    pub schema: Vec<RelationSchema>,
}

impl Snapshot {
    pub fn result(&self, id: ResultId) -> Option<&QueryResult> {
        self.results.iter().find(|result| result.id == id)
    }
}
