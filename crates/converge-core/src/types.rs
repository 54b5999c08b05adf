//! Common types shared by the engine and its remote collaborators

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A resource representation as observed or desired, always a JSON object.
pub type State = Value;

/// Name of a remote update operation (e.g. `"patch"`, `"setTargetPools"`).
pub type OperationName = String;

/// Marker operation name used when a difference forces recreation.
pub const RECREATE: &str = "recreate";

/// What remote action a change to a field requires
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "operation", rename_all = "snake_case")]
pub enum OperationSelector {
    /// The resource must be deleted and created again
    RequiresRecreate,
    /// A named in-place update operation resolves the change
    TriggersOperation(OperationName),
    /// Observational only, never planned (output-only fields)
    Ignore,
}

impl OperationSelector {
    pub fn triggers(name: impl Into<String>) -> Self {
        OperationSelector::TriggersOperation(name.into())
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, OperationSelector::Ignore)
    }

    /// Operation this selector routes to, if any
    pub fn operation(&self) -> Option<&str> {
        match self {
            OperationSelector::TriggersOperation(name) => Some(name),
            OperationSelector::RequiresRecreate => Some(RECREATE),
            OperationSelector::Ignore => None,
        }
    }
}

impl fmt::Display for OperationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationSelector::RequiresRecreate => write!(f, "RequiresRecreate"),
            OperationSelector::TriggersOperation(name) => write!(f, "TriggersOperation({})", name),
            OperationSelector::Ignore => write!(f, "Ignore"),
        }
    }
}

/// A single-field disagreement between canonical desired and actual state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Dotted path to the field, e.g. `updatePolicy.maxSurge.fixed`
    pub path: String,
    /// Value currently observed on the remote side
    pub before: Value,
    /// Value the caller wants
    pub after: Value,
    pub selector: OperationSelector,
    pub output_only: bool,
}

impl FieldDiff {
    /// Whether this difference takes part in operation planning
    pub fn is_actionable(&self) -> bool {
        !self.selector.is_ignore()
    }
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} [{}]",
            self.path, self.before, self.after, self.selector
        )?;
        if self.output_only {
            write!(f, " (output only)")?;
        }
        Ok(())
    }
}

/// Addressing information for one remote resource: its kind plus the
/// values of its identity fields. Unset identity fields are absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub identity: BTreeMap<String, String>,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identity: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.identity.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.identity.get(field).map(String::as_str)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (k, v)) in self.identity.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, ")")
    }
}

/// Opaque reference to a long-running remote job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncHandle {
    /// Job token as issued by the remote API
    pub id: String,
    /// Where the job status can be polled
    pub status_url: String,
}

impl fmt::Display for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.status_url)
    }
}

/// Progress of an asynchronous job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Finished; may carry the resource body the job produced
    Done { resource: Option<Value> },
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done { .. } | JobStatus::Failed { .. })
    }
}

/// Kind of remote mutation being submitted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update(OperationName),
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update(name) => write!(f, "{}", name),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Result of submitting a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmitResponse {
    /// The API applied the change synchronously
    Completed { resource: Option<Value> },
    /// The API started a job that must be polled
    Pending { handle: AsyncHandle },
}

/// One page of a paginated listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}
