//! Observability module
//!
//! Structured logging setup and helpers for keeping untrusted error text
//! (collaborator output, step logs) safe to emit.

pub mod telemetry;
