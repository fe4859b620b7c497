//! Shared domain types for Loop nodes.
//!
//! Pure data and logic with no I/O: the tenant [`types::Context`], the
//! training [`job::Job`] model, the [`detection::Detection`] sum type with
//! its geometry, the remote event catalogue and the [`remote::RemoteCall`]
//! seam every component uses to talk to the Loop.

pub mod detection;
pub mod error;
pub mod job;
pub mod messages;
pub mod remote;
pub mod types;

pub use error::CoreError;
