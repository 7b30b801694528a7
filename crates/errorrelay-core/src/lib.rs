//! errorrelay-core: Core library for errorrelay
//!
//! A local relay between an instrumented app and an AI assistant. The app
//! pushes runtime error reports over a WebSocket; the relay keeps the most
//! recent ones and serves them to the assistant as an MCP tool.
//!
//! # Architecture
//!
//! ```text
//! instrumented app ──WebSocket──► listener ──► HistoryBuffer ◄── query ◄── MCP stdio ◄── assistant
//!                                    ▲
//!                     arbiter (once, before bind)
//! ```
//!
//! # Modules
//!
//! - `record`: error records and inbound frame validation
//! - `history`: bounded FIFO history shared by both surfaces
//! - `listener`: WebSocket report listener
//! - `arbiter`: startup port takeover from stale relay instances
//! - `query`: text rendering of the history
//! - `mcp`: stdio MCP server exposing `get_browser_logs`
//! - `relay`: startup sequence tying it together
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod arbiter;
pub mod config;
pub mod error;
pub mod history;
pub mod listener;
pub mod logging;
pub mod mcp;
pub mod query;
pub mod record;
pub mod relay;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
