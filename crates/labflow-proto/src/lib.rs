//! # labflow-proto
//!
//! Shared types, error definitions, and traits for the labflow experiment engine.
//!
//! This crate provides the vocabulary used across all labflow crates,
//! including:
//! - Part identifiers and the two routing sentinels
//! - The `Part` capability implemented by every step and decision type
//! - Trace events, the durable record of a run
//! - Manual resolution requests and the `Resolver` boundary
//! - Typed part failures

mod error;
mod finite;
mod part;
mod part_id;
mod resolution;
mod trace_event;

pub use error::{FailureKind, PartError};
pub use part::{
    ExecutionPolicy, Inputs, Outputs, Part, PartContext, PartKind, PartOutput, PartResult,
    StoreRead,
};
pub use part_id::PartId;
pub use resolution::{LegalChoices, Resolution, ResolutionRequest, Resolver};
pub use trace_event::{EventKind, ManualResolution, TraceEvent};

/// Values held in the data store and carried by trace events.
pub type Value = serde_json::Value;
