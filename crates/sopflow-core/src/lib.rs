//! Core types and error definitions for the Sopflow engine.
//!
//! This crate provides the foundational types shared across all Sopflow crates:
//! the error taxonomy and the payloads exchanged between the dispatch loop,
//! the collaboration broker and worker agents.
//!
//! # Main types
//!
//! - [`SopflowError`] — Unified error enum for the engine.
//! - [`SopflowResult`] — Convenience alias for `Result<T, SopflowError>`.
//! - [`TaskActivation`] — Task handed to a worker.
//! - [`CollaborationMessage`] / [`CollaborationResponse`] — Delegation request and its answer.

/// Error taxonomy.
pub mod error;
/// Wire payloads.
pub mod message;

pub use error::{SopflowError, SopflowResult};
pub use message::{CollaborationMessage, CollaborationResponse, RequestStatus, TaskActivation};
