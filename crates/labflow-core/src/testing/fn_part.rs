//! Parts backed by closures.

use crate::PartRegistry;
use labflow_proto::{Part, PartContext, PartId, PartResult};
use std::sync::{Arc, Mutex, PoisonError};

type Logic = Arc<dyn Fn(&PartContext<'_>) -> PartResult + Send + Sync>;

/// Identifiers of the parts a test type executed, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<PartId>>>);

impl CallLog {
    fn push(&self, part: &PartId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(part.clone());
    }

    pub fn calls(&self) -> Vec<PartId> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_for(&self, part: &str) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|id| id.as_str() == part)
            .count()
    }
}

/// A part whose behavior is a closure.
///
/// # Example
///
/// ```
/// use labflow_core::PartRegistry;
/// use labflow_core::testing::FnPart;
/// use labflow_proto::{Outputs, PartOutput};
///
/// let mut registry = PartRegistry::with_builtins();
/// let calls = FnPart::register_step(&mut registry, "test.answer", |_ctx| {
///     Ok(PartOutput::Outputs(Outputs::new().with("answer", 42)))
/// });
/// assert!(registry.contains("test.answer"));
/// assert_eq!(calls.count(), 0);
/// ```
pub struct FnPart {
    logic: Logic,
    calls: CallLog,
}

impl FnPart {
    pub fn new<F>(logic: F) -> Self
    where
        F: Fn(&PartContext<'_>) -> PartResult + Send + Sync + 'static,
    {
        Self {
            logic: Arc::new(logic),
            calls: CallLog::default(),
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Registers a step type running `logic`; every part of the type shares
    /// the returned call log.
    pub fn register_step<F>(registry: &mut PartRegistry, name: &str, logic: F) -> CallLog
    where
        F: Fn(&PartContext<'_>) -> PartResult + Send + Sync + 'static,
    {
        let (logic, calls): (Logic, CallLog) = (Arc::new(logic), CallLog::default());
        let log = calls.clone();
        registry.register_step(name, "test step", move |_| {
            Ok(Arc::new(FnPart {
                logic: Arc::clone(&logic),
                calls: log.clone(),
            }) as Arc<dyn Part>)
        });
        calls
    }

    /// Registers a decision type running `logic`.
    pub fn register_decision<F>(registry: &mut PartRegistry, name: &str, logic: F) -> CallLog
    where
        F: Fn(&PartContext<'_>) -> PartResult + Send + Sync + 'static,
    {
        let (logic, calls): (Logic, CallLog) = (Arc::new(logic), CallLog::default());
        let log = calls.clone();
        registry.register_decision(name, "test decision", move |_| {
            Ok(Arc::new(FnPart {
                logic: Arc::clone(&logic),
                calls: log.clone(),
            }) as Arc<dyn Part>)
        });
        calls
    }
}

impl Part for FnPart {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult {
        self.calls.push(ctx.part_id);
        (self.logic)(ctx)
    }
}
