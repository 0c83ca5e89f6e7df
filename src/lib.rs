//! `domino-client` is an async client engine for the Domino query server.
//!
//! The server speaks a line-oriented protocol: newline-terminated text
//! commands answered by XML documents ending in `</response>`. The engine
//! owns one connection and exposes:
//! - a command surface: [`DominoClient::connect`], [`DominoClient::submit`],
//!   [`DominoClient::load_more`], [`DominoClient::clear`],
//!   [`DominoClient::disconnect`], [`DominoClient::format`]
//! - an observable [`Snapshot`] of connection status, per-query results,
//!   the schema listing and the last error.

mod client;
mod connection;
mod decode;
mod error;
mod format;
mod frame;
mod options;
mod registry;
mod split;
mod types;
mod wire;

#[cfg(feature = "row-map")]
pub mod row_map;

pub use client::DominoClient;
pub use decode::{decode_query_ack, decode_response, decode_schema, decode_tuple_batch};
pub use error::DominoError;
pub use format::{format_expression, format_queries};
pub use frame::FrameReader;
pub use options::{ClientOptions, Endpoint, DEFAULT_BATCH_SIZE, DEFAULT_HOST, DEFAULT_PORT};
pub use split::{split_expressions, split_queries};
pub use types::{
    ConnectionState, QueryResult, RelationSchema, RelationTable, ResultId, SchemaAttribute,
    SchemaConstraint, Snapshot, EXAMPLE_QUERIES,
};
pub use wire::{Command, QueryAck, SchemaResponse, Tuple, TupleBatch, WireResponse};

pub type Result<T> = std::result::Result<T, DominoError>;
