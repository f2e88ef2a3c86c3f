use fleetdeck_api::{ApiError, RunnerTransport};
use fleetdeck_core::{parse_source_repo, RunnerInstance, RunnerSpec, RunnerStatus, WriteCredential};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::ActivityPulse;
use crate::SharedFleetStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Stop,
    Restart,
    Delete,
    UpdateCredential,
    Clone,
    Create,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Restart => "restart",
            CommandKind::Delete => "delete",
            CommandKind::UpdateCredential => "update-credential",
            CommandKind::Clone => "clone",
            CommandKind::Create => "create",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: CommandKind,
    pub action_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("runner {id} is busy ({kind})")]
    Busy { id: u64, kind: CommandKind },
    #[error("runner {id} is not in the fleet")]
    UnknownRunner { id: u64 },
    #[error("clone count must be at least 1, got {count}")]
    InvalidCloneCount { count: u32 },
    #[error("credential must not be empty")]
    EmptyCredential,
    #[error("invalid source repository: {0}")]
    InvalidSourceRepo(&'static str),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Per-runner command locks. A runner with an entry here has a command in
/// flight; further commands for it are rejected before any network call.
#[derive(Clone, Default)]
pub struct PendingActions {
    inner: Arc<Mutex<HashMap<u64, PendingAction>>>,
}

impl PendingActions {
    pub fn get(&self, id: u64) -> Option<PendingAction> {
        self.inner.lock().unwrap().get(&id).copied()
    }

    pub fn is_busy(&self, id: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    fn begin(&self, id: u64, kind: CommandKind) -> Result<PendingGuard, DispatchError> {
        let mut map = self.inner.lock().unwrap();
        if let Some(existing) = map.get(&id) {
            return Err(DispatchError::Busy {
                id,
                kind: existing.kind,
            });
        }
        let action_id = Uuid::new_v4();
        map.insert(id, PendingAction { kind, action_id });
        Ok(PendingGuard {
            actions: Arc::clone(&self.inner),
            id,
            kind,
            action_id,
        })
    }
}

/// Clears the pending entry on every exit path, error paths included.
struct PendingGuard {
    actions: Arc<Mutex<HashMap<u64, PendingAction>>>,
    id: u64,
    kind: CommandKind,
    action_id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.actions.lock() {
            map.remove(&self.id);
        }
    }
}

/// Runs operator commands against the transport and folds the results into
/// the shared store. Lifecycle commands show a transitional status while in
/// flight and restore the pre-command instance when the transport fails.
#[derive(Clone)]
pub struct CommandDispatcher<T: RunnerTransport> {
    transport: T,
    store: SharedFleetStore,
    pending: PendingActions,
    pulse: ActivityPulse,
}

impl<T: RunnerTransport> CommandDispatcher<T> {
    pub fn new(transport: T, store: SharedFleetStore, pulse: ActivityPulse) -> Self {
        Self {
            transport,
            store,
            pending: PendingActions::default(),
            pulse,
        }
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    pub async fn start(&self, id: u64) -> Result<RunnerInstance, DispatchError> {
        let (previous, guard) = self
            .begin_transition(id, CommandKind::Start, RunnerStatus::Starting)
            .await?;
        let result = self.transport.start(id).await;
        self.finish_transition(&guard, previous, result).await
    }

    pub async fn stop(&self, id: u64) -> Result<RunnerInstance, DispatchError> {
        let (previous, guard) = self
            .begin_transition(id, CommandKind::Stop, RunnerStatus::Stopping)
            .await?;
        let result = self.transport.stop(id).await;
        self.finish_transition(&guard, previous, result).await
    }

    pub async fn restart(&self, id: u64) -> Result<RunnerInstance, DispatchError> {
        let (previous, guard) = self
            .begin_transition(id, CommandKind::Restart, RunnerStatus::Starting)
            .await?;
        let result = self.transport.restart(id).await;
        self.finish_transition(&guard, previous, result).await
    }

    /// Removal is confirmed by the backend before the store changes, so a
    /// failed delete leaves the instance in place.
    pub async fn delete(&self, id: u64) -> Result<(), DispatchError> {
        self.pulse.record();
        let guard = self.pending.begin(id, CommandKind::Delete)?;
        if !self.store.lock().await.contains(id) {
            return Err(DispatchError::UnknownRunner { id });
        }
        log_dispatched(&guard);
        match self.transport.delete(id).await {
            Ok(()) => {
                self.store.lock().await.remove(id);
                Ok(())
            }
            Err(err) => Err(log_failed(&guard, err)),
        }
    }

    pub async fn update_credential(
        &self,
        id: u64,
        credential: &WriteCredential,
    ) -> Result<RunnerInstance, DispatchError> {
        self.pulse.record();
        if credential.is_blank() {
            return Err(DispatchError::EmptyCredential);
        }
        let guard = self.pending.begin(id, CommandKind::UpdateCredential)?;
        if !self.store.lock().await.contains(id) {
            return Err(DispatchError::UnknownRunner { id });
        }
        log_dispatched(&guard);
        match self.transport.update_credential(id, credential).await {
            Ok(updated) => {
                self.store.lock().await.upsert(updated.clone());
                Ok(updated)
            }
            Err(err) => Err(log_failed(&guard, err)),
        }
    }

    pub async fn create(
        &self,
        spec: &RunnerSpec,
        credential: &WriteCredential,
    ) -> Result<RunnerInstance, DispatchError> {
        self.pulse.record();
        if credential.is_blank() {
            return Err(DispatchError::EmptyCredential);
        }
        parse_source_repo(&spec.source_repo).map_err(DispatchError::InvalidSourceRepo)?;
        info!(
            event = "command_dispatched",
            action = %CommandKind::Create,
            source_repo = %spec.source_repo
        );
        match self.transport.create(spec, credential).await {
            Ok(created) => {
                self.store.lock().await.upsert(created.clone());
                Ok(created)
            }
            Err(err) => {
                warn!(event = "command_failed", action = %CommandKind::Create, error = %err);
                Err(err.into())
            }
        }
    }

    /// All-or-nothing: the new instances land in the store together, or the
    /// fleet is left exactly as it was.
    pub async fn clone_runners(
        &self,
        id: u64,
        count: u32,
        credential: Option<&WriteCredential>,
    ) -> Result<Vec<RunnerInstance>, DispatchError> {
        self.pulse.record();
        if count == 0 {
            return Err(DispatchError::InvalidCloneCount { count });
        }
        if let Some(credential) = credential {
            if credential.is_blank() {
                return Err(DispatchError::EmptyCredential);
            }
        }
        let guard = self.pending.begin(id, CommandKind::Clone)?;
        if !self.store.lock().await.contains(id) {
            return Err(DispatchError::UnknownRunner { id });
        }
        log_dispatched(&guard);
        match self.transport.clone_runners(id, count, credential).await {
            Ok(created) => {
                let mut store = self.store.lock().await;
                for instance in &created {
                    store.upsert(instance.clone());
                }
                Ok(created)
            }
            Err(err) => Err(log_failed(&guard, err)),
        }
    }

    async fn begin_transition(
        &self,
        id: u64,
        kind: CommandKind,
        transitional: RunnerStatus,
    ) -> Result<(RunnerInstance, PendingGuard), DispatchError> {
        self.pulse.record();
        let guard = self.pending.begin(id, kind)?;
        let mut store = self.store.lock().await;
        let Some(previous) = store.get(id) else {
            return Err(DispatchError::UnknownRunner { id });
        };
        let mut optimistic = previous.clone();
        optimistic.status = transitional;
        store.upsert(optimistic);
        drop(store);
        log_dispatched(&guard);
        Ok((previous, guard))
    }

    async fn finish_transition(
        &self,
        guard: &PendingGuard,
        previous: RunnerInstance,
        result: Result<RunnerInstance, ApiError>,
    ) -> Result<RunnerInstance, DispatchError> {
        match result {
            Ok(updated) => {
                self.store.lock().await.upsert(updated.clone());
                Ok(updated)
            }
            Err(err) => {
                let err = log_failed(guard, err);
                self.store.lock().await.upsert(previous);
                Err(err)
            }
        }
    }
}

fn log_dispatched(guard: &PendingGuard) {
    info!(
        event = "command_dispatched",
        runner_id = guard.id,
        action = guard.kind.as_str(),
        action_id = %guard.action_id
    );
}

fn log_failed(guard: &PendingGuard, err: ApiError) -> DispatchError {
    warn!(
        event = "command_failed",
        runner_id = guard.id,
        action = guard.kind.as_str(),
        action_id = %guard.action_id,
        error = %err
    );
    err.into()
}
