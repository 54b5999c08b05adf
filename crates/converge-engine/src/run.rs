//! Reconciliation run record
//!
//! Every pass gets an id and a log of the states it moved through, so a
//! caller can tell "nothing changed" apart from "change attempted but not
//! completed".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Driver states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Start,
    Fetching,
    NotFound,
    Found,
    Diffing,
    Converged,
    Classifying,
    Creating,
    Recreating,
    Updating,
    Verifying,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub at: DateTime<Utc>,
    /// Operation in flight, for the executing phases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRun {
    pub run_id: String,
    pub kind: String,
    pub resource: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<PhaseTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReconcileRun {
    pub fn new(kind: &str, resource: impl fmt::Display) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            resource: resource.to_string(),
            phase: Phase::Start,
            started_at: now,
            updated_at: now,
            transitions: vec![PhaseTransition {
                phase: Phase::Start,
                at: now,
                operation: None,
            }],
            error: None,
        }
    }

    pub fn transition(&mut self, phase: Phase) {
        self.record(phase, None);
    }

    /// Enter an executing phase for a named operation
    pub fn executing(&mut self, phase: Phase, operation: &str) {
        self.record(phase, Some(operation.to_string()));
    }

    pub fn fail(&mut self, error: &impl fmt::Display) {
        self.error = Some(error.to_string());
        self.record(Phase::Failed, None);
    }

    fn record(&mut self, phase: Phase, operation: Option<String>) {
        let now = Utc::now();
        self.phase = phase;
        self.updated_at = now;
        self.transitions.push(PhaseTransition {
            phase,
            at: now,
            operation,
        });
    }

    /// Phases visited, in order
    pub fn phases(&self) -> Vec<Phase> {
        self.transitions.iter().map(|t| t.phase).collect()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.updated_at - self.started_at).num_milliseconds()
    }
}
