use chrono::{DateTime, Utc};
use fleetdeck_core::{FleetSnapshot, RunnerInstance};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod dispatch;
pub mod log_reader;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub type SharedFleetStore = Arc<Mutex<FleetStore>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Replaced,
    Upserted { id: u64 },
    Removed { id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Subscriber = Box<dyn Fn(&FleetEvent) + Send>;

/// Local cache of the runner fleet. Order follows the server's list order;
/// new upserts append. Every mutation bumps a monotonic version and notifies
/// subscribers synchronously, after the state change.
#[derive(Default)]
pub struct FleetStore {
    instances: Vec<RunnerInstance>,
    last_synced: Option<DateTime<Utc>>,
    version: u64,
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_subscriber: u64,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedFleetStore {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.instances.iter().any(|instance| instance.id == id)
    }

    pub fn get(&self, id: u64) -> Option<RunnerInstance> {
        self.instances
            .iter()
            .find(|instance| instance.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<RunnerInstance> {
        self.instances.clone()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            instances: self.instances.clone(),
            last_synced: self.last_synced,
        }
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&FleetEvent) + Send + 'static) -> SubscriberId {
        self.next_subscriber += 1;
        let id = SubscriberId(self.next_subscriber);
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    /// Wholesale snapshot swap, used by the refresh path. Stamps
    /// `last_synced`.
    pub fn replace(&mut self, instances: Vec<RunnerInstance>) {
        self.instances = instances;
        self.last_synced = Some(Utc::now());
        self.bump(FleetEvent::Replaced);
    }

    /// Guarded form of `replace`: applies only when no other mutation landed
    /// since `observed_version` was read, so a slow refresh cannot clobber a
    /// newer targeted update.
    pub fn replace_if_unchanged(
        &mut self,
        instances: Vec<RunnerInstance>,
        observed_version: u64,
    ) -> bool {
        if self.version != observed_version {
            return false;
        }
        self.replace(instances);
        true
    }

    pub fn upsert(&mut self, instance: RunnerInstance) {
        let id = instance.id;
        match self
            .instances
            .iter_mut()
            .find(|existing| existing.id == id)
        {
            Some(slot) => *slot = instance,
            None => self.instances.push(instance),
        }
        self.bump(FleetEvent::Upserted { id });
    }

    pub fn remove(&mut self, id: u64) -> Option<RunnerInstance> {
        let idx = self
            .instances
            .iter()
            .position(|instance| instance.id == id)?;
        let removed = self.instances.remove(idx);
        self.bump(FleetEvent::Removed { id });
        Some(removed)
    }

    fn bump(&mut self, event: FleetEvent) {
        self.version += 1;
        for (_, subscriber) in &self.subscribers {
            subscriber(&event);
        }
    }
}
