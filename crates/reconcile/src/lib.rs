//! Keeper reconciler: drives one project through create, read, update and
//! delete, each call returning only once the remote state has converged or
//! the operation has failed.

#![forbid(unsafe_code)]

use std::time::Duration;

use keeper_core::{
    classify, Classification, ForbiddenPolicy, Labels, Operation, PreviousState, Project, ProjectClient, ProjectId,
    ProjectSnapshot, ProjectSpec, ProjectStatus, ReconcileError, RemoteError,
};
use keeper_poll::{poll_until, retry, Attempt, PollConfig, PollError, RetryError, StateWait};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reconciler settings; timeouts are supplied per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub poll: PollConfig,
    pub forbidden: ForbiddenPolicy,
}

impl ReconcilerConfig {
    /// Poll pacing from `KEEPER_POLL_*`; `KEEPER_FORBIDDEN_IS_NOT_FOUND=0|false`
    /// makes forbidden responses hard errors.
    pub fn from_env() -> Self {
        let forbidden = match std::env::var("KEEPER_FORBIDDEN_IS_NOT_FOUND") {
            Ok(v) if v == "0" || v.eq_ignore_ascii_case("false") => ForbiddenPolicy::Surface,
            _ => ForbiddenPolicy::TreatAsNotFound,
        };
        Self { poll: PollConfig::from_env(), forbidden }
    }
}

/// Fields sent by an update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Always present: the control plane rejects updates without a name.
    pub name: String,
    /// Complete desired set when it differs from the previous one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
}

impl UpdatePayload {
    pub fn plan(desired: &ProjectSpec, previous: &PreviousState) -> Self {
        let wanted = desired.desired_labels();
        let labels = if wanted != previous.labels { Some(wanted) } else { None };
        Self { name: desired.name.clone(), labels }
    }
}

pub struct Reconciler<C> {
    client: C,
    config: ReconcilerConfig,
}

impl<C: ProjectClient> Reconciler<C> {
    pub fn new(client: C, config: ReconcilerConfig) -> Self { Self { client, config } }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    /// Create a project and wait until it is Active.
    pub async fn create(&self, desired: &ProjectSpec, timeout: Duration) -> Result<Project, ReconcileError> {
        let t0 = Instant::now();
        info!(name = %desired.name, labels = ?desired.labels, "project create start");
        let res = self.create_inner(desired, timeout, t0).await;
        let label = res.as_ref().map(|p| p.id.to_string()).unwrap_or_else(|e| e.id().to_string());
        self.finish(Operation::Create, &label, t0, res)
    }

    async fn create_inner(&self, desired: &ProjectSpec, timeout: Duration, t0: Instant) -> Result<Project, ReconcileError> {
        let op = Operation::Create;
        let id = self
            .client
            .create(&desired.name, desired.labels.as_ref().filter(|l| !l.is_empty()))
            .await
            .map_err(|e| ReconcileError::from_remote(desired.name.clone(), op, e, self.config.forbidden))?;
        info!(project = %id, "project created; waiting for it to become Active");

        let wait = StateWait::until(&[ProjectStatus::Inactive.as_str()], &[ProjectStatus::Active.as_str()])
            .with_forbidden_policy(self.config.forbidden);
        poll_until(&wait, timeout, &self.config.poll, || self.probe(&id, op))
            .await
            .map_err(|e| self.poll_failure(&id, op, timeout, e))?;

        let remaining = timeout.saturating_sub(t0.elapsed());
        match self.read_as(&id, op, remaining).await? {
            Some(project) => Ok(project),
            None => Err(ReconcileError::OperationFailed {
                id: id.to_string(),
                op,
                reason: "project disappeared right after becoming Active".to_string(),
            }),
        }
    }

    /// Read the current view; `Ok(None)` when the project no longer exists
    /// (or is no longer visible) so the caller can drop it.
    pub async fn read(&self, id: &ProjectId, timeout: Duration) -> Result<Option<Project>, ReconcileError> {
        let t0 = Instant::now();
        let res = self.read_as(id, Operation::Read, timeout).await;
        self.finish(Operation::Read, id.as_str(), t0, res)
    }

    /// Apply desired name/labels, then return the post-update view.
    pub async fn update(
        &self,
        id: &ProjectId,
        desired: &ProjectSpec,
        previous: &PreviousState,
        timeout: Duration,
    ) -> Result<Project, ReconcileError> {
        let t0 = Instant::now();
        let res = self.update_inner(id, desired, previous, timeout).await;
        self.finish(Operation::Update, id.as_str(), t0, res)
    }

    async fn update_inner(
        &self,
        id: &ProjectId,
        desired: &ProjectSpec,
        previous: &PreviousState,
        timeout: Duration,
    ) -> Result<Project, ReconcileError> {
        let op = Operation::Update;
        let payload = UpdatePayload::plan(desired, previous);
        if payload.name != previous.name {
            info!(project = %id, from = %previous.name, to = %payload.name, "project name change");
        }
        if let Some(labels) = &payload.labels {
            info!(project = %id, from = ?previous.labels, to = ?labels, "project labels change");
        }
        self.client
            .update(id, &payload.name, payload.labels.as_ref())
            .await
            .map_err(|e| ReconcileError::from_remote(id.to_string(), op, e, self.config.forbidden))?;

        match self.read_as(id, op, timeout).await? {
            Some(project) => Ok(project),
            None => Err(ReconcileError::NotFound { id: id.to_string(), op }),
        }
    }

    /// Delete a project and wait until the control plane no longer reports it.
    pub async fn delete(&self, id: &ProjectId, timeout: Duration) -> Result<(), ReconcileError> {
        let t0 = Instant::now();
        let res = self.delete_inner(id, timeout).await;
        self.finish(Operation::Delete, id.as_str(), t0, res)
    }

    async fn delete_inner(&self, id: &ProjectId, timeout: Duration) -> Result<(), ReconcileError> {
        let op = Operation::Delete;
        self.client
            .delete(id)
            .await
            .map_err(|e| ReconcileError::from_remote(id.to_string(), op, e, self.config.forbidden))?;
        info!(project = %id, "project delete issued; waiting for it to disappear");

        let wait = StateWait::until_gone().with_forbidden_policy(self.config.forbidden);
        poll_until(&wait, timeout, &self.config.poll, || self.probe(id, op))
            .await
            .map_err(|e| self.poll_failure(id, op, timeout, e))?;
        info!(project = %id, "project destroyed");
        Ok(())
    }

    async fn probe(&self, id: &ProjectId, op: Operation) -> Result<(ProjectSnapshot, String), RemoteError> {
        let snap = self.client.get(id).await?;
        match op {
            Operation::Delete => debug!(
                project = %id,
                status = %snap.status,
                deletion_timestamp = ?snap.deletion_timestamp,
                "project deletion in progress"
            ),
            _ => debug!(project = %id, op = %op, status = %snap.status, "waiting on project state"),
        }
        let state = snap.status.clone();
        Ok((snap, state))
    }

    /// Flat retry around a single get: not-found is absence, transient
    /// failures retry until `timeout`, anything else aborts.
    async fn read_as(&self, id: &ProjectId, op: Operation, timeout: Duration) -> Result<Option<Project>, ReconcileError> {
        let cfg = self.config.poll.without_initial_delay();
        let policy = self.config.forbidden;
        let res = retry(timeout, &cfg, || async move {
            match self.client.get(id).await {
                Ok(snap) => Project::materialize(id, op, snap).map(Some).map_err(Attempt::Abort),
                Err(e) => match classify(&e, policy) {
                    Classification::NotFound => {
                        debug!(project = %id, op = %op, error = %e, "project not visible; treating as absent");
                        Ok(None)
                    }
                    Classification::Retryable => {
                        counter!("keeper_retry_transient", 1u64);
                        warn!(project = %id, op = %op, error = %e, "network issue while reading project; retrying");
                        Err(Attempt::Retry(format!("transient failure: {}", e)))
                    }
                    Classification::NonRetryable => {
                        debug!(project = %id, op = %op, error = %e, "unexpected error reading project");
                        Err(Attempt::Abort(ReconcileError::NonRetryableRemote { id: id.to_string(), op, source: e }))
                    }
                },
            }
        })
        .await;
        match res {
            Ok(v) => Ok(v),
            Err(RetryError::Aborted(e)) => Err(e),
            Err(RetryError::Timeout { last, .. }) => {
                Err(ReconcileError::Timeout { id: id.to_string(), op, timeout, last_state: last })
            }
        }
    }

    fn poll_failure(&self, id: &ProjectId, op: Operation, timeout: Duration, err: PollError<RemoteError>) -> ReconcileError {
        let id = id.to_string();
        match err {
            PollError::Remote(source) => ReconcileError::NonRetryableRemote { id, op, source },
            PollError::Vanished => ReconcileError::OperationFailed {
                id,
                op,
                reason: "project not found while waiting for it to become Active".to_string(),
            },
            PollError::UnexpectedState { state, expected } => ReconcileError::UnexpectedState { id, op, state, expected },
            PollError::Timeout { last_state, .. } => ReconcileError::Timeout { id, op, timeout, last_state },
        }
    }

    fn finish<T>(&self, op: Operation, id: &str, t0: Instant, res: Result<T, ReconcileError>) -> Result<T, ReconcileError> {
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("keeper_op_latency_ms", took_ms, "op" => op.as_str());
        match &res {
            Ok(_) => {
                counter!("keeper_op_ok", 1u64, "op" => op.as_str());
                info!(project = %id, op = %op, took_ms = took_ms as u64, "project op ok");
            }
            Err(e) => {
                counter!("keeper_op_err", 1u64, "op" => op.as_str());
                warn!(project = %id, op = %op, error = %e, took_ms = took_ms as u64, "project op failed");
            }
        }
        res
    }
}
