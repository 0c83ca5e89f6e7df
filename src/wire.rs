use std::collections::BTreeMap;

use crate::{DominoError, RelationSchema, Result};

/// One tuple of a batch: attribute name to cell text.
pub type Tuple = BTreeMap<String, String>;

/// Status literal signaling success.
pub(crate) const STATUS_OK: &str = "ok";

/// Text commands understood by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Schema,
    Query(String),
    Next { session: String, count: usize },
    Close(String),
}

impl Command {
    /// Encodes the command as one newline-terminated line.
    ///
    /// Commands are line-delimited, so embedded line breaks in query text
    /// are sent as spaces.
    pub fn encode(&self) -> String {
        match self {
            Self::Schema => "SCHEMA\n".to_owned(),
            Self::Query(text) => format!("QUERY {}\n", text.replace(['\r', '\n'], " ")),
            Self::Next { session, count } => format!("NEXT {session} {count}\n"),
            Self::Close(session) => format!("CLOSE {session}\n"),
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) fn verb(&self) -> &'static str {
        match self {
            Self::Schema => "SCHEMA",
            Self::Query(_) => "QUERY",
            Self::Next { .. } => "NEXT",
            Self::Close(_) => "CLOSE",
        }
    }
}

/// Acknowledgement of a `QUERY` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryAck {
    pub status: String,
    pub session_id: Option<String>,
    pub message: Option<String>,
}

impl QueryAck {
    /// Session opened by a successful acknowledgement.
    pub(crate) fn into_open_session(self) -> Option<String> {
        if self.status == STATUS_OK {
            self.session_id
        } else {
            None
        }
    }
}

/// Rows returned by a `NEXT` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TupleBatch {
    pub status: String,
    pub tuples: Vec<Tuple>,
    pub message: Option<String>,
}

/// Relation listing returned by a `SCHEMA` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaResponse {
    pub status: String,
    pub relations: Vec<RelationSchema>,
    pub message: Option<String>,
}

/// Any decoded response document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireResponse {
    QueryAck(QueryAck),
    TupleBatch(TupleBatch),
    Schema(SchemaResponse),
}

impl WireResponse {
    pub fn status(&self) -> &str {
        match self {
            Self::QueryAck(ack) => &ack.status,
            Self::TupleBatch(batch) => &batch.status,
            Self::Schema(schema) => &schema.status,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::QueryAck(ack) => ack.message.as_deref(),
            Self::TupleBatch(batch) => batch.message.as_deref(),
            Self::Schema(schema) => schema.message.as_deref(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == STATUS_OK
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::QueryAck(_) => "query acknowledgement",
            Self::TupleBatch(_) => "tuple batch",
            Self::Schema(_) => "schema",
        }
    }

    pub fn into_query_ack(self) -> Result<QueryAck> {
        match self {
            Self::QueryAck(ack) => Ok(ack),
            other => Err(other.unexpected("query acknowledgement")),
        }
    }

    pub fn into_tuple_batch(self) -> Result<TupleBatch> {
        match self {
            Self::TupleBatch(batch) => Ok(batch),
            other => Err(other.unexpected("tuple batch")),
        }
    }

    pub fn into_schema(self) -> Result<SchemaResponse> {
        match self {
            Self::Schema(schema) => Ok(schema),
            other => Err(other.unexpected("schema")),
        }
    }

    fn unexpected(&self, expected: &str) -> DominoError {
        DominoError::MalformedDocument(format!(
            "expected {expected} response, got {}",
            self.kind()
        ))
    }
}
