//! snippet-sandbox-mcp library
//!
//! This crate provides the core functionality for the sandbox daemon:
//! - Configuration loading and per-request isolation constraints
//! - The execution engine and its two isolation backends
//! - Guard code for the subprocess backend
//! - Preview servers for HTML and React, tracked in a resource registry
//! - MCP (stdio) and HTTP transports over the same tool catalog

pub mod backend;
pub mod catalog;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod guard;
pub mod http;
pub mod mcp;
pub mod preview;
pub mod request;
pub mod rpc;
pub mod workspace;
