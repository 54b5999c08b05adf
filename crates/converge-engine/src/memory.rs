//! In-memory [`ResourceApi`]
//!
//! Behaves like an eventually consistent management API: mutations run as
//! jobs that finish after a configurable number of polls, deleted resources
//! can stay readable for a few fetches, and updates carrying a stale
//! concurrency token are rejected. Used for dry runs and tests.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

use converge_core::{
    AsyncHandle, Error, JobStatus, OperationKind, Page, ResourceKey, Result, State, SubmitResponse,
};

use crate::api::ResourceApi;

/// A mutation as the API received it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub key: ResourceKey,
    pub kind: OperationKind,
    pub body: Value,
}

#[derive(Debug)]
enum Effect {
    Put(State),
    Remove,
}

#[derive(Debug)]
struct Job {
    key: ResourceKey,
    effect: Option<Effect>,
    remaining_polls: u32,
    failure: Option<String>,
    result: Option<JobStatus>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceKey, State>,
    /// Deleted resources still visible to reads, with remaining visible fetches
    ghosts: HashMap<ResourceKey, (State, u32)>,
    jobs: HashMap<String, Job>,
    next_job: u64,
    submissions: Vec<Submission>,
    polls: u64,
    fail_next_job: Option<String>,
}

/// Tunables for [`MemoryApi`]
#[derive(Debug, Clone, Default)]
pub struct MemoryApiConfig {
    /// Polls before a job finishes; 0 answers synchronously
    pub job_polls: u32,
    /// Fetches that still see a resource after its delete completed
    pub delete_lag: u32,
    /// Field holding the concurrency token
    pub token_field: Option<String>,
    /// Values the server fills in when a create leaves them out
    pub server_defaults: Map<String, Value>,
    pub page_size: usize,
}

#[derive(Debug)]
pub struct MemoryApi {
    config: MemoryApiConfig,
    inner: Mutex<Inner>,
}

impl Default for MemoryApi {
    fn default() -> Self {
        Self::new(MemoryApiConfig::default())
    }
}

impl MemoryApi {
    pub fn new(config: MemoryApiConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_job_polls(mut self, polls: u32) -> Self {
        self.config.job_polls = polls;
        self
    }

    pub fn with_delete_lag(mut self, fetches: u32) -> Self {
        self.config.delete_lag = fetches;
        self
    }

    pub fn with_token_field(mut self, field: &str) -> Self {
        self.config.token_field = Some(field.to_string());
        self
    }

    pub fn with_server_default(mut self, field: &str, value: Value) -> Self {
        self.config.server_defaults.insert(field.to_string(), value);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::internal("memory api state poisoned"))
    }

    /// Store a resource directly, bypassing jobs
    pub fn seed(&self, key: ResourceKey, state: State) -> Result<()> {
        let state = self.stamp(state);
        let mut inner = self.lock()?;
        inner.ghosts.remove(&key);
        inner.resources.insert(key, state);
        Ok(())
    }

    /// Simulate an out-of-band change to a stored resource
    pub fn mutate<F>(&self, key: &ResourceKey, f: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut inner = self.lock()?;
        let state = inner
            .resources
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        if let Some(obj) = state.as_object_mut() {
            f(obj);
        }
        let stamped = self.stamp(state.take());
        *state = stamped;
        Ok(())
    }

    pub fn stored(&self, key: &ResourceKey) -> Option<State> {
        self.lock().ok()?.resources.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.resources.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock()
            .map(|inner| inner.submissions.clone())
            .unwrap_or_default()
    }

    pub fn poll_count(&self) -> u64 {
        self.lock().map(|inner| inner.polls).unwrap_or(0)
    }

    /// Make the next submitted job finish as failed
    pub fn fail_next_job(&self, message: &str) -> Result<()> {
        self.lock()?.fail_next_job = Some(message.to_string());
        Ok(())
    }

    /// Recompute the concurrency token of a state
    fn stamp(&self, mut state: State) -> State {
        let Some(field) = &self.config.token_field else {
            return state;
        };
        if let Some(obj) = state.as_object_mut() {
            obj.remove(field);
            let token = fingerprint(&Value::Object(obj.clone()));
            obj.insert(field.clone(), Value::String(token));
        }
        state
    }

    fn apply(&self, inner: &mut Inner, key: &ResourceKey, effect: Effect) -> Option<State> {
        match effect {
            Effect::Put(state) => {
                let state = self.stamp(state);
                inner.ghosts.remove(key);
                inner.resources.insert(key.clone(), state.clone());
                Some(state)
            }
            Effect::Remove => {
                if let Some(state) = inner.resources.remove(key) {
                    if self.config.delete_lag > 0 {
                        inner
                            .ghosts
                            .insert(key.clone(), (state, self.config.delete_lag));
                    }
                }
                None
            }
        }
    }

    /// State a mutation produces, checked against the current state
    fn plan_effect(&self, inner: &Inner, key: &ResourceKey, kind: &OperationKind, body: &Value) -> Result<Effect> {
        let current = inner.resources.get(key);
        match kind {
            OperationKind::Create => {
                if current.is_some() {
                    return Err(Error::conflict(format!("{} already exists", key), None));
                }
                let mut state = body
                    .as_object()
                    .cloned()
                    .ok_or_else(|| Error::invalid_input("create body must be an object"))?;
                for (field, value) in &self.config.server_defaults {
                    let missing = state.get(field).map_or(true, Value::is_null);
                    if missing {
                        state.insert(field.clone(), value.clone());
                    }
                }
                for (field, value) in &key.identity {
                    state
                        .entry(field.clone())
                        .or_insert_with(|| Value::String(value.clone()));
                }
                Ok(Effect::Put(Value::Object(state)))
            }
            OperationKind::Update(_) => {
                let current = current.ok_or_else(|| Error::not_found(key.to_string()))?;
                let mut state = current.as_object().cloned().unwrap_or_default();
                let patch = body
                    .as_object()
                    .ok_or_else(|| Error::invalid_input("update body must be an object"))?;
                if let Some(field) = &self.config.token_field {
                    let sent = patch.get(field).and_then(Value::as_str);
                    let held = state.get(field).and_then(Value::as_str);
                    if sent != held {
                        return Err(Error::conflict(
                            format!("{} has changed since {} was read", key, field),
                            sent.map(str::to_string),
                        ));
                    }
                }
                for (field, value) in patch {
                    if Some(field) == self.config.token_field.as_ref() {
                        continue;
                    }
                    state.insert(field.clone(), value.clone());
                }
                Ok(Effect::Put(Value::Object(state)))
            }
            OperationKind::Delete => {
                if current.is_none() {
                    return Err(Error::not_found(key.to_string()));
                }
                Ok(Effect::Remove)
            }
        }
    }
}

/// Short content hash used as the concurrency token
pub fn fingerprint(state: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(state).unwrap_or_default().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[async_trait]
impl ResourceApi for MemoryApi {
    async fn fetch(&self, key: &ResourceKey) -> Result<State> {
        let mut inner = self.lock()?;
        if let Some(state) = inner.resources.get(key) {
            return Ok(state.clone());
        }
        if let Some((state, remaining)) = inner.ghosts.get_mut(key) {
            let state = state.clone();
            *remaining -= 1;
            if *remaining == 0 {
                inner.ghosts.remove(key);
            }
            debug!(resource = %key, "Serving stale read of deleted resource");
            return Ok(state);
        }
        Err(Error::not_found(key.to_string()))
    }

    async fn list(&self, parent: &ResourceKey, page_token: Option<&str>, page_size: Option<u32>) -> Result<Page> {
        let inner = self.lock()?;
        let start: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| Error::invalid_input(format!("bad page token {:?}", token)))?,
            None => 0,
        };
        let size = page_size
            .map(|s| s as usize)
            .filter(|s| *s > 0)
            .or(Some(self.config.page_size).filter(|s| *s > 0))
            .unwrap_or(usize::MAX);

        let matching: Vec<&State> = inner
            .resources
            .iter()
            .filter(|(key, _)| {
                key.kind == parent.kind
                    && parent
                        .identity
                        .iter()
                        .all(|(field, value)| key.get(field) == Some(value.as_str()))
            })
            .map(|(_, state)| state)
            .collect();

        let end = start.saturating_add(size).min(matching.len());
        let items = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|s| (*s).clone())
            .collect();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn submit(&self, key: &ResourceKey, kind: &OperationKind, body: &Value) -> Result<SubmitResponse> {
        let mut inner = self.lock()?;
        inner.submissions.push(Submission {
            key: key.clone(),
            kind: kind.clone(),
            body: body.clone(),
        });

        let effect = self.plan_effect(&inner, key, kind, body)?;
        let failure = inner.fail_next_job.take();

        if self.config.job_polls == 0 && failure.is_none() {
            let resource = self.apply(&mut inner, key, effect);
            return Ok(SubmitResponse::Completed { resource });
        }

        inner.next_job += 1;
        let id = format!("operation-{}", inner.next_job);
        inner.jobs.insert(
            id.clone(),
            Job {
                key: key.clone(),
                effect: Some(effect),
                remaining_polls: self.config.job_polls,
                failure,
                result: None,
            },
        );
        debug!(resource = %key, operation = %kind, job = %id, "Started job");
        Ok(SubmitResponse::Pending {
            handle: AsyncHandle {
                status_url: format!("operations/{}", id),
                id,
            },
        })
    }

    async fn poll(&self, handle: &AsyncHandle) -> Result<JobStatus> {
        let mut inner = self.lock()?;
        inner.polls += 1;
        let job = inner
            .jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::not_found(format!("operation {}", handle.id)))?;

        if let Some(result) = &job.result {
            return Ok(result.clone());
        }
        if job.remaining_polls > 1 {
            job.remaining_polls -= 1;
            return Ok(JobStatus::Running);
        }

        let key = job.key.clone();
        let effect = job.effect.take();
        let status = match job.failure.take() {
            Some(message) => JobStatus::Failed { message },
            None => {
                let resource = match effect {
                    Some(effect) => self.apply(&mut inner, &key, effect),
                    None => None,
                };
                JobStatus::Done { resource }
            }
        };
        if let Some(job) = inner.jobs.get_mut(&handle.id) {
            job.result = Some(status.clone());
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("test.Group").with("project", "p").with("name", name)
    }

    #[tokio::test]
    async fn test_job_finishes_after_polls() {
        let api = MemoryApi::default().with_job_polls(3).with_token_field("fingerprint");
        let resp = api
            .submit(&key("web"), &OperationKind::Create, &json!({"targetSize": 1}))
            .await
            .unwrap();
        let SubmitResponse::Pending { handle } = resp else {
            panic!("expected a pending job");
        };

        assert!(api.fetch(&key("web")).await.unwrap_err().is_not_found());
        assert_eq!(api.poll(&handle).await.unwrap(), JobStatus::Running);
        assert_eq!(api.poll(&handle).await.unwrap(), JobStatus::Running);
        let JobStatus::Done { resource: Some(resource) } = api.poll(&handle).await.unwrap() else {
            panic!("expected job to finish with a resource");
        };
        assert_eq!(resource["name"], "web");
        assert!(resource["fingerprint"].is_string());
        assert_eq!(api.fetch(&key("web")).await.unwrap(), resource);
        assert_eq!(api.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_stale_token_conflicts() {
        let api = MemoryApi::default().with_token_field("fingerprint");
        api.seed(key("web"), json!({"name": "web", "targetSize": 1})).unwrap();

        let err = api
            .submit(
                &key("web"),
                &OperationKind::Update("patch".into()),
                &json!({"targetSize": 2, "fingerprint": "stale"}),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = api.fetch(&key("web")).await.unwrap();
        api.submit(
            &key("web"),
            &OperationKind::Update("patch".into()),
            &json!({"targetSize": 2, "fingerprint": current["fingerprint"]}),
        )
        .await
        .unwrap();
        let updated = api.fetch(&key("web")).await.unwrap();
        assert_eq!(updated["targetSize"], 2);
        assert_ne!(updated["fingerprint"], current["fingerprint"]);
    }

    #[tokio::test]
    async fn test_delete_lag_serves_stale_reads() {
        let api = MemoryApi::default().with_delete_lag(2);
        api.seed(key("web"), json!({"name": "web"})).unwrap();
        api.submit(&key("web"), &OperationKind::Delete, &json!({}))
            .await
            .unwrap();

        assert!(api.fetch(&key("web")).await.is_ok());
        assert!(api.fetch(&key("web")).await.is_ok());
        assert!(api.fetch(&key("web")).await.unwrap_err().is_not_found());
        assert!(api.is_empty());
    }

    #[tokio::test]
    async fn test_list_pages_by_scope() {
        let api = MemoryApi::default();
        for name in ["a", "b", "c"] {
            api.seed(key(name), json!({"name": name})).unwrap();
        }
        api.seed(
            ResourceKey::new("test.Group").with("project", "other").with("name", "z"),
            json!({"name": "z"}),
        )
        .unwrap();

        let scope = ResourceKey::new("test.Group").with("project", "p");
        let first = api.list(&scope, None, Some(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = api
            .list(&scope, first.next_page_token.as_deref(), Some(2))
            .await
            .unwrap();
        assert_eq!(second.items, vec![json!({"name": "c"})]);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_failed_job() {
        let api = MemoryApi::default();
        api.fail_next_job("quota exceeded").unwrap();
        let resp = api
            .submit(&key("web"), &OperationKind::Create, &json!({}))
            .await
            .unwrap();
        let SubmitResponse::Pending { handle } = resp else {
            panic!("failing jobs are always asynchronous");
        };
        assert_eq!(
            api.poll(&handle).await.unwrap(),
            JobStatus::Failed {
                message: "quota exceeded".into()
            }
        );
        assert!(api.fetch(&key("web")).await.is_err());
    }
}
