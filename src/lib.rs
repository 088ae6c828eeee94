//! # Power BI MCP Server
//!
//! A Model Context Protocol (MCP) server for Power BI datasets and Analysis
//! Services tabular models, spoken to directly over XMLA.
//!
//! This crate provides:
//! - **Session**: one authenticated XMLA session at a time, with background
//!   schema discovery
//! - **Tools**: entity listing and description, DAX execution
//! - **Natural language**: question-to-DAX and result summaries, when a
//!   language model is configured
//!
//! ## Architecture
//!
//! Each tool call flows through the [`tools::Dispatcher`], which routes it to
//! the [`session::SessionManager`], the [`schema::SchemaCache`], the
//! [`executor::QueryExecutor`] or the [`bridge::NlBridge`] and shapes the
//! outcome into a uniform envelope.

pub mod bridge;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod sanitize;
pub mod schema;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod tools;
pub mod transport;
pub mod xmla;

pub use config::Config;
pub use error::{ErrorKind, ServerError};
pub use server::PowerBiMcpServer;
