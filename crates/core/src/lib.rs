//! Keeper core types: projects, the remote client seam and the error taxonomy
//! shared by the poll engine and the reconciler.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod classify;
pub mod mock;

pub use classify::{classify, Classification, Classify, ForbiddenPolicy};

/// Free-form project tags. Ordered so payloads and diffs are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Opaque identifier assigned by the control plane on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ProjectId {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ProjectId {
    fn from(v: String) -> Self { Self(v) }
}

/// Lifecycle status reported by the control plane.
///
/// A deleted project has no status; absence is inferred from a not-found
/// classification instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    Inactive,
    Active,
    /// Deletion grace period: the project is still readable.
    Terminating,
}

impl ProjectStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Inactive => "Inactive",
            ProjectStatus::Active => "Active",
            ProjectStatus::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Inactive" => Ok(ProjectStatus::Inactive),
            "Active" => Ok(ProjectStatus::Active),
            "Terminating" => Ok(ProjectStatus::Terminating),
            other => Err(format!("unknown project status '{}'", other)),
        }
    }
}

/// Caller's desired attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    /// `None` means the caller never set labels (nothing is sent on create).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), labels: None }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Desired label set with "unset" collapsed to empty.
    pub fn desired_labels(&self) -> Labels { self.labels.clone().unwrap_or_default() }
}

/// One remote read of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Raw state label; kept as a string so unanticipated states stay reportable.
    pub status: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Last-known local copy used by update to decide what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousState {
    pub name: String,
    pub labels: Labels,
}

impl From<&Project> for PreviousState {
    fn from(p: &Project) -> Self {
        Self { name: p.name.clone(), labels: p.labels.clone() }
    }
}

/// Materialized local view of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub labels: Labels,
    pub status: ProjectStatus,
    pub creation_timestamp: String,
    pub deletion_timestamp: Option<String>,
}

impl Project {
    /// Copy every attribute of a remote snapshot into the local view.
    /// A value the local model cannot hold fails the whole copy.
    pub fn materialize(id: &ProjectId, op: Operation, snap: ProjectSnapshot) -> Result<Self, ReconcileError> {
        let invalid = |field: &'static str, reason: String| ReconcileError::InvalidField {
            id: id.to_string(),
            op,
            field,
            reason,
        };
        if snap.name.is_empty() {
            return Err(invalid("name", "remote returned an empty name".to_string()));
        }
        if let Some(key) = snap.labels.keys().find(|k| k.is_empty()) {
            return Err(invalid("labels", format!("empty label key (value '{}')", snap.labels[key])));
        }
        let status = snap.status.parse::<ProjectStatus>().map_err(|e| invalid("status", e))?;
        Ok(Self {
            id: id.clone(),
            name: snap.name,
            labels: snap.labels,
            status,
            creation_timestamp: render_timestamp(&snap.creation_timestamp),
            deletion_timestamp: snap.deletion_timestamp.as_ref().map(render_timestamp),
        })
    }
}

/// Canonical string form of a remote timestamp (RFC 3339, millisecond precision, `Z`).
pub fn render_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lifecycle operation being performed; named in every surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Failure of a single remote call, carrying what the classifier needs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("transport: {message}")]
    Transport {
        message: String,
        /// The request timed out at the network level.
        timeout: bool,
        /// Connectivity failure expected to clear on its own (refused, reset, DNS).
        temporary: bool,
    },
    #[error("remote returned {code}: {message}")]
    Status { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        RemoteError::Status { code, message: message.into() }
    }

    pub fn not_found() -> Self { Self::status(404, "project not found") }
    pub fn forbidden() -> Self { Self::status(403, "forbidden") }

    pub fn timeout(message: impl Into<String>) -> Self {
        RemoteError::Transport { message: message.into(), timeout: true, temporary: false }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        RemoteError::Transport { message: message.into(), timeout: false, temporary: true }
    }
}

/// Errors surfaced by lifecycle operations.
///
/// `id` is the project identifier, or the desired name when the failure
/// happened before the control plane assigned one.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{op} project '{id}': transient transport failure: {source}")]
    RetryableTransport { id: String, op: Operation, #[source] source: RemoteError },
    #[error("{op} project '{id}': {source}")]
    NonRetryableRemote { id: String, op: Operation, #[source] source: RemoteError },
    #[error("{op} project '{id}': project not found")]
    NotFound { id: String, op: Operation },
    #[error("{op} project '{id}': timed out after {timeout:?}, last observed state '{last_state}'")]
    Timeout { id: String, op: Operation, timeout: Duration, last_state: String },
    #[error("{op} project '{id}': unexpected state '{state}' (expected one of: {expected})")]
    UnexpectedState { id: String, op: Operation, state: String, expected: String },
    #[error("{op} project '{id}': {reason}")]
    OperationFailed { id: String, op: Operation, reason: String },
    #[error("{op} project '{id}': invalid {field}: {reason}")]
    InvalidField { id: String, op: Operation, field: &'static str, reason: String },
}

impl ReconcileError {
    /// Wrap a failed single remote call according to its classification.
    pub fn from_remote(id: impl Into<String>, op: Operation, source: RemoteError, policy: ForbiddenPolicy) -> Self {
        let id = id.into();
        match classify(&source, policy) {
            Classification::Retryable => ReconcileError::RetryableTransport { id, op, source },
            Classification::NonRetryable => ReconcileError::NonRetryableRemote { id, op, source },
            Classification::NotFound => ReconcileError::NotFound { id, op },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ReconcileError::RetryableTransport { id, .. }
            | ReconcileError::NonRetryableRemote { id, .. }
            | ReconcileError::NotFound { id, .. }
            | ReconcileError::Timeout { id, .. }
            | ReconcileError::UnexpectedState { id, .. }
            | ReconcileError::OperationFailed { id, .. }
            | ReconcileError::InvalidField { id, .. } => id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ReconcileError::RetryableTransport { op, .. }
            | ReconcileError::NonRetryableRemote { op, .. }
            | ReconcileError::NotFound { op, .. }
            | ReconcileError::Timeout { op, .. }
            | ReconcileError::UnexpectedState { op, .. }
            | ReconcileError::OperationFailed { op, .. }
            | ReconcileError::InvalidField { op, .. } => *op,
        }
    }

    /// Whether a caller may reasonably re-issue the whole operation.
    pub fn classification(&self) -> Classification {
        match self {
            ReconcileError::RetryableTransport { .. } | ReconcileError::Timeout { .. } => Classification::Retryable,
            ReconcileError::NotFound { .. } => Classification::NotFound,
            _ => Classification::NonRetryable,
        }
    }
}

/// Narrow remote client seam: create/get/update/delete by identity.
#[async_trait::async_trait]
pub trait ProjectClient: Send + Sync {
    /// Create a project; returns the identity assigned by the control plane.
    async fn create(&self, name: &str, labels: Option<&Labels>) -> Result<ProjectId, RemoteError>;

    async fn get(&self, id: &ProjectId) -> Result<ProjectSnapshot, RemoteError>;

    /// Replace mutable attributes. `labels: None` leaves labels untouched;
    /// `Some` replaces the whole set.
    async fn update(&self, id: &ProjectId, name: &str, labels: Option<&Labels>) -> Result<(), RemoteError>;

    async fn delete(&self, id: &ProjectId) -> Result<(), RemoteError>;
}

#[async_trait::async_trait]
impl<C: ProjectClient + ?Sized> ProjectClient for std::sync::Arc<C> {
    async fn create(&self, name: &str, labels: Option<&Labels>) -> Result<ProjectId, RemoteError> {
        (**self).create(name, labels).await
    }

    async fn get(&self, id: &ProjectId) -> Result<ProjectSnapshot, RemoteError> { (**self).get(id).await }

    async fn update(&self, id: &ProjectId, name: &str, labels: Option<&Labels>) -> Result<(), RemoteError> {
        (**self).update(id, name, labels).await
    }

    async fn delete(&self, id: &ProjectId) -> Result<(), RemoteError> { (**self).delete(id).await }
}

pub mod prelude {
    pub use super::{
        Classification, ForbiddenPolicy, Labels, Operation, PreviousState, Project, ProjectClient, ProjectId,
        ProjectSnapshot, ProjectSpec, ProjectStatus, ReconcileError, RemoteError,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str, status: &str) -> ProjectSnapshot {
        ProjectSnapshot {
            name: name.to_string(),
            labels: Labels::from([("env".to_string(), "prod".to_string())]),
            status: status.to_string(),
            creation_timestamp: DateTime::from_timestamp(1_704_067_200, 5_000_000).unwrap(),
            deletion_timestamp: None,
        }
    }

    #[test]
    fn materialize_renders_timestamps() {
        let id = ProjectId::new("p-1");
        let p = Project::materialize(&id, Operation::Read, snap("team-a", "Active")).unwrap();
        assert_eq!(p.status, ProjectStatus::Active);
        assert_eq!(p.creation_timestamp, "2024-01-01T00:00:00.005Z");
        assert_eq!(p.deletion_timestamp, None);
        assert_eq!(p.labels.get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn materialize_rejects_unknown_status() {
        let id = ProjectId::new("p-1");
        let err = Project::materialize(&id, Operation::Read, snap("team-a", "Exploding")).unwrap_err();
        match &err {
            ReconcileError::InvalidField { field, .. } => assert_eq!(*field, "status"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.classification(), Classification::NonRetryable);
        assert!(err.to_string().contains("read project 'p-1'"), "err={}", err);
    }

    #[test]
    fn materialize_rejects_empty_name() {
        let id = ProjectId::new("p-1");
        let err = Project::materialize(&id, Operation::Read, snap("", "Active")).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidField { field: "name", .. }));
    }

    #[test]
    fn errors_name_project_and_operation() {
        let e = ReconcileError::Timeout {
            id: "p-9".into(),
            op: Operation::Delete,
            timeout: Duration::from_secs(5),
            last_state: "Terminating".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("delete project 'p-9'"), "msg={}", msg);
        assert!(msg.contains("Terminating"), "msg={}", msg);
        assert_eq!(e.id(), "p-9");
        assert_eq!(e.operation(), Operation::Delete);
    }

    #[test]
    fn from_remote_maps_by_classification() {
        let e = ReconcileError::from_remote("p-1", Operation::Update, RemoteError::status(409, "conflict"), ForbiddenPolicy::default());
        assert!(matches!(e, ReconcileError::NonRetryableRemote { .. }));
        let e = ReconcileError::from_remote("p-1", Operation::Update, RemoteError::forbidden(), ForbiddenPolicy::default());
        assert!(matches!(e, ReconcileError::NotFound { .. }));
        let e = ReconcileError::from_remote("p-1", Operation::Create, RemoteError::timeout("slow"), ForbiddenPolicy::default());
        assert!(matches!(e, ReconcileError::RetryableTransport { .. }));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [ProjectStatus::Inactive, ProjectStatus::Active, ProjectStatus::Terminating] {
            assert_eq!(s.as_str().parse::<ProjectStatus>().unwrap(), s);
        }
    }
}
