//! Testing utilities for deterministic experiment tests.

mod fn_part;
mod memory_run;
mod scripted_resolver;

pub use fn_part::{CallLog, FnPart};
pub use memory_run::MemoryRun;
pub use scripted_resolver::{ScriptedResolver, SeenRequests};
