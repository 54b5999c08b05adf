//! Grouping of field differences into remote operations

use serde::Serialize;

use converge_core::{FieldDiff, OperationName, OperationSelector, RECREATE};

/// One in-place update operation and the differences that triggered it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedOperation {
    pub name: OperationName,
    pub diffs: Vec<FieldDiff>,
}

/// What a set of differences requires
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
    /// Recreation subsumes every other change
    pub recreate: bool,
    /// Distinct update operations in first-occurrence order; empty when
    /// `recreate` is set
    pub operations: Vec<PlannedOperation>,
}

impl Classification {
    /// Nothing to do
    pub fn is_converged(&self) -> bool {
        !self.recreate && self.operations.is_empty()
    }

    pub fn operation_names(&self) -> Vec<&str> {
        if self.recreate {
            return vec![RECREATE];
        }
        self.operations.iter().map(|op| op.name.as_str()).collect()
    }
}

/// Classify differences. Ignore-tagged differences never produce work.
pub fn classify(diffs: &[FieldDiff]) -> Classification {
    let mut classification = Classification::default();
    for diff in diffs {
        match &diff.selector {
            OperationSelector::Ignore => {}
            OperationSelector::RequiresRecreate => classification.recreate = true,
            OperationSelector::TriggersOperation(name) => {
                match classification.operations.iter_mut().find(|op| &op.name == name) {
                    Some(op) => op.diffs.push(diff.clone()),
                    None => classification.operations.push(PlannedOperation {
                        name: name.clone(),
                        diffs: vec![diff.clone()],
                    }),
                }
            }
        }
    }
    if classification.recreate {
        classification.operations.clear();
    }
    classification
}
