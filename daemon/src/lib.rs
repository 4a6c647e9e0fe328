//! sandbox-runner daemon library
//!
//! This crate runs untrusted code snippets and small projects inside
//! resource-bounded containers:
//! - Admission control bounding concurrent executions
//! - Request validation and isolation spec construction
//! - Backend trait and a docker-compatible CLI backend
//! - Outcome classification and an append-only audit log
//! - MCP server exposing it all as tools

pub mod admission;
pub mod archive;
pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod outcome;
pub mod request;
pub mod workspace;
