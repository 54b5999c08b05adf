//! Long-running operation documents
//!
//! Mutations answer either with the resource itself or with an operation
//! document:
//!
//! ```json
//! {"name": "operation-17", "status": "RUNNING", "selfLink": ".../operations/operation-17"}
//! ```
//!
//! A document with `status: DONE` is finished; it failed if it carries an
//! `error` with one or more entries.

use serde::Deserialize;
use serde_json::Value;

use converge_core::{AsyncHandle, JobStatus, SubmitResponse};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDocument {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub self_link: Option<String>,
    #[serde(default)]
    pub error: Option<OperationErrors>,
    /// Resource body some APIs attach to a finished operation
    #[serde(default)]
    pub response: Option<Value>,
}

impl OperationDocument {
    /// Parse `body` if it looks like an operation document
    pub fn detect(body: &Value) -> Option<Self> {
        let status = body.get("status")?.as_str()?;
        if !matches!(status, "PENDING" | "RUNNING" | "DONE") || body.get("name").is_none() {
            return None;
        }
        serde_json::from_value(body.clone()).ok()
    }

    pub fn handle(&self) -> AsyncHandle {
        AsyncHandle {
            id: self.name.clone(),
            status_url: self
                .self_link
                .clone()
                .unwrap_or_else(|| format!("operations/{}", self.name)),
        }
    }

    fn failure(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        let message = errors
            .iter()
            .map(|e| match (&e.code, &e.message) {
                (Some(code), Some(message)) => format!("{}: {}", code, message),
                (None, Some(message)) => message.clone(),
                (Some(code), None) => code.clone(),
                (None, None) => "unknown error".to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Some(message)
    }

    pub fn job_status(&self) -> JobStatus {
        match self.status.as_str() {
            "PENDING" => JobStatus::Pending,
            "DONE" => match self.failure() {
                Some(message) => JobStatus::Failed { message },
                None => JobStatus::Done {
                    resource: self.response.clone(),
                },
            },
            _ => JobStatus::Running,
        }
    }
}

/// Interpret the body of a mutation response
pub fn submit_response(body: Option<Value>) -> SubmitResponse {
    let Some(body) = body.filter(|b| !b.is_null()) else {
        return SubmitResponse::Completed { resource: None };
    };
    match OperationDocument::detect(&body) {
        Some(doc) => SubmitResponse::Pending {
            handle: doc.handle(),
        },
        None => SubmitResponse::Completed {
            resource: Some(body),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_running_operation_is_pending_submit() {
        let resp = submit_response(Some(json!({
            "name": "operation-1",
            "status": "RUNNING",
            "selfLink": "https://api.test/v1/projects/p/zones/z/operations/operation-1",
        })));
        let SubmitResponse::Pending { handle } = resp else {
            panic!("expected a pending submit");
        };
        assert_eq!(handle.id, "operation-1");
        assert!(handle.status_url.ends_with("operations/operation-1"));
    }

    #[test]
    fn test_plain_resource_is_completed() {
        let body = json!({"name": "web", "status": {"isStable": true}});
        assert_eq!(
            submit_response(Some(body.clone())),
            SubmitResponse::Completed { resource: Some(body) }
        );
        assert_eq!(
            submit_response(None),
            SubmitResponse::Completed { resource: None }
        );
    }

    #[test]
    fn test_done_with_errors_fails() {
        let doc = OperationDocument::detect(&json!({
            "name": "operation-2",
            "status": "DONE",
            "error": {"errors": [
                {"code": "QUOTA_EXCEEDED", "message": "quota exceeded"},
                {"message": "second"},
            ]},
        }))
        .unwrap();
        assert_eq!(
            doc.job_status(),
            JobStatus::Failed {
                message: "QUOTA_EXCEEDED: quota exceeded; second".into()
            }
        );
    }

    #[test]
    fn test_done_carries_response() {
        let doc = OperationDocument::detect(&json!({
            "name": "operation-3",
            "status": "DONE",
            "response": {"name": "web"},
        }))
        .unwrap();
        assert_eq!(
            doc.job_status(),
            JobStatus::Done {
                resource: Some(json!({"name": "web"}))
            }
        );
        assert_eq!(doc.handle().status_url, "operations/operation-3");
    }
}
