//! # emberdb-stream
//!
//! Async client for the EmberDB analytical query engine that lets you run
//! SQL over HTTP and stream millions of typed rows without running out of
//! memory.
//!
//! ## Why?
//!
//! Loading an analytical result set eagerly is fine until it isn't:
//!
//! ```ignore
//! // This will OOM with millions of rows!
//! let result = connection.execute(query, options).await?.fetch_result();
//! ```
//!
//! `emberdb-stream` also speaks the engine's streaming protocol, delivering
//! rows one at a time with backpressure toward the server:
//!
//! ```ignore
//! // Process millions of rows with bounded memory usage
//! let statement = connection.execute_stream(query, options).await?;
//! let (columns, mut rows) = statement.stream_result().await?;
//! while let Some(row) = rows.next().await {
//!     process(row?);
//! }
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberdb_stream::{Connection, ConnectionOptions, ExecuteOptions, NoAuth};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Zero-auth local deployment; cloud deployments use connect_v1 /
//!     // connect_v2 with an Authenticator.
//!     let connection = Connection::connect_core(
//!         ConnectionOptions::default().with_endpoint("http://localhost:3473"),
//!         Arc::new(NoAuth),
//!         reqwest::Client::new(),
//!     )?;
//!
//!     let statement = connection
//!         .execute("SELECT id, name FROM users", ExecuteOptions::default())
//!         .await?;
//!     for row in statement.fetch_result().data {
//!         println!("{:?}", row);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Server-driven sessions**: `USE ENGINE`, `USE DATABASE` and `SET` work
//!   over stateless HTTP; the client resends the full parameter set on every
//!   request and follows `Update-Parameters` / `Reset-Session` /
//!   `Update-Endpoint` response headers
//! - **Three deployment generations**: legacy account/engine resolution,
//!   SQL-driven system-engine resolution, and zero-auth local deployments
//! - **Typed rows**: dates, UTC timestamps, arbitrary-precision decimals,
//!   binary, nested arrays and structs, hydrated from the engine's wire-type
//!   grammar
//! - **Bounded memory**: streamed results flow through a watermarked queue
//!   that pauses the transport when the consumer falls behind
//! - **Error handling**: all errors are returned as Results, no panics

pub mod auth;
pub mod channel;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hydrate;
pub mod session;
pub mod statement;
pub mod types;
pub mod value;

// Re-export main types at crate root
pub use auth::{Authenticator, NoAuth, StaticToken};
pub use channel::{FlowState, RowStream, SourceAction};
pub use connection::{Connection, ConnectionOptions, ConnectionVariant};
pub use error::{CompositeError, Error, Result, ServerError};
pub use session::{AccountInfo, SessionState};
pub use statement::{ExecuteOptions, Statement, StreamStatement};
pub use types::{Column, QueryResult, Row, Statistics, WireType};
pub use value::Value;

// Re-export the frame decoder for advanced use cases
pub use frame::{Frame, FrameDecoder};
