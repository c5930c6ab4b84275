//! Scripted in-memory client for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::{Labels, ProjectClient, ProjectId, ProjectSnapshot, RemoteError};

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { name: String, labels: Option<Labels> },
    Get(ProjectId),
    Update { id: ProjectId, name: String, labels: Option<Labels> },
    Delete(ProjectId),
}

type GetResult = Result<ProjectSnapshot, RemoteError>;

#[derive(Default)]
struct MockState {
    assigned_id: Option<ProjectId>,
    gets: VecDeque<GetResult>,
    last_get: Option<GetResult>,
    create_err: Option<RemoteError>,
    update_err: Option<RemoteError>,
    delete_err: Option<RemoteError>,
    calls: Vec<Call>,
}

/// Mock client. Get responses are served from a script in order; once the
/// script runs out the last response repeats (404 when nothing was scripted).
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

impl MockClient {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity returned by `create` (default `p-1`).
    pub fn with_id(self, id: impl Into<ProjectId>) -> Self {
        self.state().assigned_id = Some(id.into());
        self
    }

    pub fn push_get(&self, res: GetResult) -> &Self {
        self.state().gets.push_back(res);
        self
    }

    /// Script a found project in the given state.
    pub fn push_state(&self, name: &str, labels: &Labels, status: &str) -> &Self {
        self.push_get(Ok(snapshot(name, labels, status)))
    }

    pub fn fail_create(&self, err: RemoteError) { self.state().create_err = Some(err); }
    pub fn fail_update(&self, err: RemoteError) { self.state().update_err = Some(err); }
    pub fn fail_delete(&self, err: RemoteError) { self.state().delete_err = Some(err); }

    pub fn calls(&self) -> Vec<Call> { self.state().calls.clone() }

    pub fn get_count(&self) -> usize {
        self.state().calls.iter().filter(|c| matches!(c, Call::Get(_))).count()
    }

    pub fn updates(&self) -> Vec<Call> {
        self.state().calls.iter().filter(|c| matches!(c, Call::Update { .. })).cloned().collect()
    }
}

/// Snapshot with a fixed creation timestamp (2024-01-01T00:00:00Z).
pub fn snapshot(name: &str, labels: &Labels, status: &str) -> ProjectSnapshot {
    ProjectSnapshot {
        name: name.to_string(),
        labels: labels.clone(),
        status: status.to_string(),
        creation_timestamp: DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default(),
        deletion_timestamp: None,
    }
}

#[async_trait::async_trait]
impl ProjectClient for MockClient {
    async fn create(&self, name: &str, labels: Option<&Labels>) -> Result<ProjectId, RemoteError> {
        let mut st = self.state();
        st.calls.push(Call::Create { name: name.to_string(), labels: labels.cloned() });
        if let Some(err) = st.create_err.clone() {
            return Err(err);
        }
        Ok(st.assigned_id.clone().unwrap_or_else(|| ProjectId::new("p-1")))
    }

    async fn get(&self, id: &ProjectId) -> Result<ProjectSnapshot, RemoteError> {
        let mut st = self.state();
        st.calls.push(Call::Get(id.clone()));
        match st.gets.pop_front() {
            Some(res) => {
                st.last_get = Some(res.clone());
                res
            }
            None => st.last_get.clone().unwrap_or_else(|| Err(RemoteError::not_found())),
        }
    }

    async fn update(&self, id: &ProjectId, name: &str, labels: Option<&Labels>) -> Result<(), RemoteError> {
        let mut st = self.state();
        st.calls.push(Call::Update { id: id.clone(), name: name.to_string(), labels: labels.cloned() });
        match st.update_err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete(&self, id: &ProjectId) -> Result<(), RemoteError> {
        let mut st = self.state();
        st.calls.push(Call::Delete(id.clone()));
        match st.delete_err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
