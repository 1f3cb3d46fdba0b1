//! # labflow-core
//!
//! Core experiment engine for labflow.
//!
//! This crate provides:
//! - Experiment configuration loading and validation
//! - The part registry and the built-in part types
//! - The global data store
//! - The trace recorder, reader and replayer
//! - The transition loop and the sub-flow executor
//! - The experiment manager that ties them into runs

mod cancel;
mod config;
mod data_store;
mod error;
mod experiment;
mod manager;
pub mod parts;
mod registry;
mod resolvers;
mod subflow;
pub mod testing;
mod trace_reader;
mod trace_recorder;
mod trace_replayer;
mod transition;

pub use cancel::CancelToken;
pub use config::{ConfigError, ConfigWarning, ExperimentConfig, ExperimentSection, NextPartConfig, PartConfig};
pub use data_store::DataStore;
pub use error::{EngineError, TraceError};
pub use experiment::{Experiment, FlowBody, NextPart, PartBody, PartNode};
pub use manager::{ExperimentManager, RunOutcome, RunState, TerminationReason};
pub use registry::{ConfigValues, PartConstructor, PartFactory, PartRegistry, PartType};
pub use resolvers::{DeferResolver, RecordedResolver};
pub use trace_reader::{MalformedLine, TailBatch, TraceLog, TraceTail};
pub use trace_recorder::TraceRecorder;
pub use trace_replayer::{PathEntry, Replay, ReplayCursor};
