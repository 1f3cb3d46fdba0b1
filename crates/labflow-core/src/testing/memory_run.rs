//! Running experiments against an in-memory trace.

use crate::{
    DataStore, EngineError, Experiment, ExperimentManager, Replay, RunOutcome, TraceError,
    TraceLog, TraceRecorder,
};
use labflow_proto::{Resolver, TraceEvent};
use std::io::{Cursor, Write};
use std::sync::Arc;

/// The result of a run recorded into memory.
#[derive(Debug)]
pub struct MemoryRun {
    pub outcome: RunOutcome,
    pub store: DataStore,
    pub log: TraceLog,
}

impl MemoryRun {
    /// Runs `experiment` from its start.
    pub fn start(
        experiment: Arc<Experiment>,
        resolver: impl Resolver + Send + 'static,
    ) -> Result<Self, EngineError> {
        let recorder = TraceRecorder::new(Vec::new());
        let mut manager = ExperimentManager::new(experiment, recorder, Box::new(resolver));
        let outcome = manager.run()?;
        let (store, recorder) = manager.into_parts();
        Ok(Self {
            outcome,
            store,
            log: parse(recorder.into_inner())?,
        })
    }

    /// Replays `events` and continues the run; the returned log holds the
    /// replayed events followed by the new ones.
    pub fn resume(
        experiment: Arc<Experiment>,
        events: &[TraceEvent],
        resolver: impl Resolver + Send + 'static,
    ) -> Result<Self, EngineError> {
        let mut buffer = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buffer, event).map_err(TraceError::from)?;
            writeln!(buffer).map_err(TraceError::from)?;
        }
        let prefix = parse(buffer.clone())?;
        let replay = Replay::from_log(&prefix, experiment.initial_store());
        let recorder = TraceRecorder::with_start(buffer, replay.next_sequence());
        let mut manager =
            ExperimentManager::resuming(experiment, replay, recorder, Box::new(resolver));
        let outcome = manager.run()?;
        let (store, recorder) = manager.into_parts();
        Ok(Self {
            outcome,
            store,
            log: parse(recorder.into_inner())?,
        })
    }

    pub fn events(&self) -> &[TraceEvent] {
        self.log.events()
    }

    /// `event_kind` names in trace order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.log.events().iter().map(TraceEvent::kind_name).collect()
    }

    /// Identifiers of the parts that started, in trace order.
    pub fn started(&self) -> Vec<String> {
        self.log
            .filter_by_kind("part_started")
            .map(|e| e.part_id.to_string())
            .collect()
    }
}

fn parse(bytes: Vec<u8>) -> Result<TraceLog, EngineError> {
    Ok(TraceLog::from_reader(Cursor::new(bytes))?)
}
