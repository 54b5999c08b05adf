//! Reconciliation driver
//!
//! Runs one pass of Fetch → Canonicalize → Diff → Classify → Execute →
//! Verify for a single resource. Each step consumes the previous step's
//! output; nothing is cached between passes.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use converge_core::{EngineConfig, Error, FieldDiff, Page, ResourceKey, Result, State, RECREATE};

use crate::api::ResourceApi;
use crate::classify::{classify, Classification};
use crate::diff::actionable;
use crate::matcher::matches;
use crate::operation::{cancellable, ApiOperation, CreateOperation, DeleteOperation, OperationContext};
use crate::policy::{Lifecycle, LifecycleSet, ReconcilePolicy};
use crate::resource::ResourceType;
use crate::run::{Phase, ReconcileRun};

/// What a successful pass did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Converged,
    Created,
    Updated { operations: Vec<String> },
    Recreated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    /// Canonical observed state after the pass
    pub state: State,
    pub action: Action,
    /// Differences the pass started from
    pub diffs: Vec<FieldDiff>,
    pub run: ReconcileRun,
}

/// Dry-run result: what `reconcile` would do right now
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub key: ResourceKey,
    pub exists: bool,
    pub desired: State,
    pub observed: Option<State>,
    pub diffs: Vec<FieldDiff>,
    pub classification: Classification,
}

impl Plan {
    pub fn is_converged(&self) -> bool {
        self.exists && self.classification.is_converged()
    }

    /// Operation names in execution order; `create` when absent
    pub fn operations(&self) -> Vec<&str> {
        if self.exists {
            self.classification.operation_names()
        } else {
            vec!["create"]
        }
    }
}

/// Outcome of a filtered sweep
#[derive(Debug, Default)]
pub struct DeleteAllReport {
    pub deleted: Vec<ResourceKey>,
    pub failures: Vec<(ResourceKey, Error)>,
}

impl DeleteAllReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Reconciler {
    api: Arc<dyn ResourceApi>,
    resource_type: Arc<ResourceType>,
    policy: ReconcilePolicy,
    lifecycle: LifecycleSet,
    page_size: Option<u32>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ResourceApi>, resource_type: Arc<ResourceType>) -> Self {
        Self {
            api,
            resource_type,
            policy: ReconcilePolicy::default(),
            lifecycle: LifecycleSet::new(),
            page_size: None,
        }
    }

    pub fn from_config(api: Arc<dyn ResourceApi>, resource_type: Arc<ResourceType>, config: &EngineConfig) -> Self {
        Self::new(api, resource_type)
            .with_policy(ReconcilePolicy::from(&config.reconcile))
            .with_page_size(config.api.page_size)
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lifecycle(mut self, directives: impl IntoIterator<Item = Lifecycle>) -> Self {
        self.lifecycle.extend(directives);
        self
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    fn blocked(&self, directive: Lifecycle, what: impl FnOnce() -> String) -> Result<()> {
        if self.lifecycle.contains(&directive) {
            return Err(Error::ApplyInfeasible(format!("{} ({})", what(), directive)));
        }
        Ok(())
    }

    /// Key used for the initial fetch: the hint when it is for this kind
    fn fetch_key(&self, target: &ResourceKey, hint: Option<&ResourceKey>) -> ResourceKey {
        match hint {
            Some(hint) if hint.kind == self.resource_type.kind() => hint.clone(),
            Some(hint) => {
                warn!(
                    expected = self.resource_type.kind(),
                    got = %hint.kind,
                    "Ignoring state hint of the wrong kind"
                );
                target.clone()
            }
            None => target.clone(),
        }
    }

    /// Fetch and canonicalize the observed state; None when absent
    async fn fetch_initial(
        &self,
        key: &ResourceKey,
        raw_desired: &State,
        cancel: &CancellationToken,
    ) -> Result<Option<State>> {
        info!(resource = %key, "Fetching initial state");
        match cancellable(cancel, self.api.fetch(key)).await {
            Ok(raw) => {
                let rt = &self.resource_type;
                let new = rt.canonicalize_new(&raw, raw_desired)?;
                Ok(Some(rt.canonicalize_initial(&new, raw_desired)))
            }
            Err(e) if e.is_not_found() => {
                info!(resource = %key, "Resource not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_operation(
        &self,
        operation: &dyn ApiOperation,
        desired: &State,
        key: &ResourceKey,
        diffs: &[FieldDiff],
        cancel: &CancellationToken,
    ) -> Result<Option<State>> {
        let ctx = OperationContext {
            api: self.api.as_ref(),
            resource_type: &self.resource_type,
            key,
            policy: &self.policy,
            cancel,
            diffs,
        };
        info!(operation = operation.name(), resource = %key, "Performing operation");
        operation.execute(desired, &ctx).await
    }

    /// Compute what `reconcile` would do without mutating anything.
    pub async fn plan(
        &self,
        raw_desired: &State,
        hint: Option<&ResourceKey>,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let rt = &self.resource_type;
        rt.validate_desired(raw_desired)?;
        let target = rt.key_for(raw_desired)?;
        let fetch_key = self.fetch_key(&target, hint);

        let observed = self.fetch_initial(&fetch_key, raw_desired, cancel).await?;
        let desired = rt.canonicalize_desired(raw_desired, observed.as_ref())?;
        let diffs = match &observed {
            Some(observed) => rt.diff(Some(&desired), Some(observed))?,
            None => rt.diff(Some(&desired), Some(&json!({})))?,
        };
        let classification = match observed {
            Some(_) => classify(&diffs),
            None => Classification::default(),
        };
        info!(
            resource = %target,
            exists = observed.is_some(),
            operations = ?classification.operation_names(),
            "Created plan"
        );
        Ok(Plan {
            key: target,
            exists: observed.is_some(),
            desired,
            observed,
            diffs,
            classification,
        })
    }

    /// Drive the resource to `raw_desired`.
    ///
    /// `hint` overrides the identity used for the initial fetch, which lets
    /// a caller reconcile a renamed resource against its old address.
    pub async fn reconcile(
        &self,
        raw_desired: &State,
        hint: Option<&ResourceKey>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let rt = &self.resource_type;
        rt.validate_desired(raw_desired)?;
        let target = rt.key_for(raw_desired)?;
        let fetch_key = self.fetch_key(&target, hint);

        let mut run = ReconcileRun::new(rt.kind(), &target);
        match self
            .drive(raw_desired, &target, &fetch_key, cancel, &mut run)
            .await
        {
            Ok((state, action, diffs)) => {
                run.transition(Phase::Done);
                info!(
                    run_id = %run.run_id,
                    resource = %target,
                    ?action,
                    duration_ms = run.duration_ms(),
                    "Apply was successful"
                );
                Ok(ReconcileOutcome {
                    state,
                    action,
                    diffs,
                    run,
                })
            }
            Err(e) => {
                let last = run.phase;
                run.fail(&e);
                error!(
                    run_id = %run.run_id,
                    resource = %target,
                    phase = %last,
                    "Reconciliation failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        raw_desired: &State,
        target: &ResourceKey,
        fetch_key: &ResourceKey,
        cancel: &CancellationToken,
        run: &mut ReconcileRun,
    ) -> Result<(State, Action, Vec<FieldDiff>)> {
        let rt = &self.resource_type;

        run.transition(Phase::Fetching);
        let initial = self
            .fetch_initial(fetch_key, raw_desired, cancel)
            .await
            .map_err(|e| e.during("fetch", Vec::new()))?;

        let Some(initial) = initial else {
            run.transition(Phase::NotFound);
            self.blocked(Lifecycle::BlockCreation, || {
                format!("{} does not exist and creation is blocked", target)
            })?;
            let desired = rt.canonicalize_desired(raw_desired, None)?;
            let diffs = rt.diff(Some(&desired), Some(&json!({})))?;

            run.executing(Phase::Creating, "create");
            let first_response = self
                .run_operation(&CreateOperation, &desired, target, &diffs, cancel)
                .await
                .map_err(|e| e.during("create", diffs.clone()))?;

            run.transition(Phase::Verifying);
            let state = self
                .verify(raw_desired, target, first_response, "create", &diffs, cancel)
                .await?;
            return Ok((state, Action::Created, diffs));
        };

        run.transition(Phase::Found);
        self.blocked(Lifecycle::BlockAcquire, || {
            format!("{} already exists and acquiring it is blocked", fetch_key)
        })?;

        let desired = rt.canonicalize_desired(raw_desired, Some(&initial))?;
        run.transition(Phase::Diffing);
        let diffs = rt.diff(Some(&desired), Some(&initial))?;
        for diff in &diffs {
            debug!(resource = %target, "Found difference: {}", diff);
        }

        let classification = classify(&diffs);
        if classification.is_converged() {
            run.transition(Phase::Converged);
            info!(resource = %target, "Resource is already converged");
            return Ok((initial, Action::Converged, diffs));
        }

        run.transition(Phase::Classifying);
        info!(
            resource = %target,
            operations = ?classification.operation_names(),
            "Created plan"
        );

        if classification.recreate {
            self.blocked(Lifecycle::BlockDestruction, || {
                format!("{} must be recreated and destruction is blocked", fetch_key)
            })?;
            self.blocked(Lifecycle::BlockCreation, || {
                format!("{} must be recreated and creation is blocked", target)
            })?;

            run.executing(Phase::Recreating, RECREATE);
            self.run_operation(&DeleteOperation, &initial, fetch_key, &diffs, cancel)
                .await
                .map_err(|e| e.during(RECREATE, diffs.clone()))?;
            let first_response = self
                .run_operation(&CreateOperation, &desired, target, &diffs, cancel)
                .await
                .map_err(|e| e.during(RECREATE, diffs.clone()))?;

            run.transition(Phase::Verifying);
            let state = self
                .verify(raw_desired, target, first_response, RECREATE, &diffs, cancel)
                .await?;
            return Ok((state, Action::Recreated, diffs));
        }

        self.blocked(Lifecycle::BlockModification, || {
            format!("{} needs an update and modification is blocked", target)
        })?;

        let mut performed = Vec::with_capacity(classification.operations.len());
        for planned in &classification.operations {
            run.executing(Phase::Updating, &planned.name);
            let operation = rt
                .operation(&planned.name)
                .map_err(|e| e.during(&planned.name, diffs.clone()))?;
            self.run_operation(operation.as_ref(), &desired, target, &planned.diffs, cancel)
                .await
                .map_err(|e| e.during(&planned.name, diffs.clone()))?;
            performed.push(planned.name.clone());
        }

        run.transition(Phase::Verifying);
        let state = self
            .verify(raw_desired, target, None, &performed.join(", "), &diffs, cancel)
            .await?;
        Ok((state, Action::Updated { operations: performed }, diffs))
    }

    /// Re-fetch and confirm the pass converged. Failures name the
    /// operations that ran and the differences they were resolving.
    async fn verify(
        &self,
        raw_desired: &State,
        key: &ResourceKey,
        first_response: Option<State>,
        after: &str,
        diffs: &[FieldDiff],
        cancel: &CancellationToken,
    ) -> Result<State> {
        self.confirm(raw_desired, key, first_response, cancel)
            .await
            .map_err(|e| e.during(format!("verify after {}", after), diffs.to_vec()))
    }

    async fn confirm(
        &self,
        raw_desired: &State,
        key: &ResourceKey,
        first_response: Option<State>,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let rt = &self.resource_type;
        let fetched = cancellable(cancel, self.api.fetch(key)).await?;
        let merged = merge_first_response(fetched, first_response);
        let new = rt.canonicalize_new(&merged, raw_desired)?;
        let new = rt.canonicalize_initial(&new, raw_desired);

        let desired = rt.canonicalize_desired(raw_desired, Some(&new))?;
        let residual = actionable(&rt.diff(Some(&desired), Some(&new))?);
        if !residual.is_empty() {
            warn!(resource = %key, state = %new, "Differences remain after apply");
            return Err(Error::DiffAfterApply(residual));
        }
        Ok(new)
    }

    /// Delete the resource `raw` addresses. Absent resources succeed.
    pub async fn delete(&self, raw: &State, cancel: &CancellationToken) -> Result<()> {
        let key = self.resource_type.key_for(raw)?;
        self.delete_key(&key, cancel).await
    }

    pub async fn delete_key(&self, key: &ResourceKey, cancel: &CancellationToken) -> Result<()> {
        self.blocked(Lifecycle::BlockDestruction, || {
            format!("deleting {} is blocked", key)
        })?;
        self.run_operation(&DeleteOperation, &Value::Null, key, &[], cancel)
            .await
            .map_err(|e| e.during("delete", Vec::new()))?;
        Ok(())
    }

    /// One page of the resources in the scope of `parent`.
    pub async fn list(&self, parent: &State, page_token: Option<&str>) -> Result<Page> {
        let rt = &self.resource_type;
        let scope = rt.parent_key(parent);
        let mut page = self.api.list(&scope, page_token, self.page_size).await?;

        // Listings may omit the scope fields; records carry the request's
        for item in page.items.iter_mut() {
            if let Some(obj) = item.as_object_mut() {
                for name in rt.parent_fields() {
                    let missing = obj.get(name).map_or(true, Value::is_null);
                    if let (true, Some(v)) = (missing, parent.get(name)) {
                        obj.insert(name.clone(), v.clone());
                    }
                }
            }
        }
        Ok(page)
    }

    /// Every resource in the scope of `parent`, following page tokens.
    pub async fn list_all(&self, parent: &State) -> Result<Vec<State>> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list(parent, token.as_deref()).await?;
            debug!(count = page.items.len(), "Listed page");
            items.extend(page.items);
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Locate the listed record with the same identity as `desired`.
    pub async fn find(&self, desired: &State) -> Result<Option<State>> {
        let rt = &self.resource_type;
        let found = self
            .list_all(desired)
            .await?
            .into_iter()
            .find(|candidate| matches(rt, candidate, desired));
        Ok(found)
    }

    /// Delete every resource in the scope of `parent` accepted by `filter`.
    ///
    /// Individual failures do not stop the sweep.
    pub async fn delete_all<F>(
        &self,
        parent: &State,
        filter: F,
        cancel: &CancellationToken,
    ) -> Result<DeleteAllReport>
    where
        F: Fn(&State) -> bool,
    {
        self.blocked(Lifecycle::BlockDestruction, || "bulk deletion is blocked".to_string())?;

        let mut report = DeleteAllReport::default();
        for item in self.list_all(parent).await? {
            if !filter(&item) {
                continue;
            }
            let key = match self.resource_type.key_for(&item) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping listed record without identity: {}", e);
                    report
                        .failures
                        .push((ResourceKey::new(self.resource_type.kind()), e));
                    continue;
                }
            };
            match self.delete_key(&key, cancel).await {
                Ok(()) => report.deleted.push(key),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(resource = %key, "Delete failed: {}", e);
                    report.failures.push((key, e));
                }
            }
        }
        info!(
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Delete-all finished"
        );
        Ok(report)
    }
}

/// Fill fields only the create response knows about into the fetched state
fn merge_first_response(fetched: State, first_response: Option<State>) -> State {
    match (fetched, first_response) {
        (Value::Object(mut fetched), Some(Value::Object(first))) => {
            for (k, v) in first {
                let missing = fetched.get(&k).map_or(true, Value::is_null);
                if missing && !v.is_null() {
                    fetched.insert(k, v);
                }
            }
            Value::Object(fetched)
        }
        (fetched, _) => fetched,
    }
}
