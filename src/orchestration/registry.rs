//! Worker registry.
//!
//! The coordinator's view of the workers that have registered with it:
//! which capabilities each advertises, how many tasks it takes at once,
//! whether it currently accepts work, and the order in which they
//! registered. Load is not stored here; it is derived from the task store
//! so the two can never drift apart.

use crate::transport::ParticipantId;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: ParticipantId,
    pub capabilities: BTreeSet<String>,
    /// Most tasks assigned at once. `None` is unbounded.
    pub max_concurrent: Option<usize>,
    pub available: bool,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn can_run(&self, capability: &str) -> bool {
        self.available && self.capabilities.contains(capability)
    }

    /// Whether one more task fits next to `load` active ones.
    pub fn has_room(&self, load: usize) -> bool {
        self.max_concurrent.map_or(true, |max| load < max)
    }
}

/// Registered workers in registration order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` with `capabilities` and no concurrency bound.
    pub fn register<I, S>(&mut self, id: ParticipantId, capabilities: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_with_limit(id, capabilities, None)
    }

    /// Register `id` with `capabilities`, taking at most `max_concurrent`
    /// tasks at once.
    ///
    /// Registering an id again replaces its capabilities and bound and marks
    /// it available, but keeps its original position for tie-breaking.
    /// Returns `true` for a new worker.
    pub fn register_with_limit<I, S>(
        &mut self,
        id: ParticipantId,
        capabilities: I,
        max_concurrent: Option<usize>,
    ) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        if let Some(existing) = self.workers.iter_mut().find(|w| w.id == id) {
            existing.capabilities = capabilities;
            existing.max_concurrent = max_concurrent;
            existing.available = true;
            return false;
        }
        self.workers.push(WorkerRecord {
            id,
            capabilities,
            max_concurrent,
            available: true,
            registered_at: Utc::now(),
        });
        true
    }

    /// Returns `false` if `id` is not registered.
    pub fn set_available(&mut self, id: &ParticipantId, available: bool) -> bool {
        match self.workers.iter_mut().find(|w| &w.id == id) {
            Some(worker) => {
                worker.available = available;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<WorkerRecord> {
        let index = self.workers.iter().position(|w| &w.id == id)?;
        Some(self.workers.remove(index))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| &w.id == id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.iter()
    }

    /// Available workers advertising `capability`, in registration order.
    pub fn capable(&self, capability: &str) -> impl Iterator<Item = &WorkerRecord> {
        let capability = capability.to_string();
        self.workers.iter().filter(move |w| w.can_run(&capability))
    }

    /// Pick the capable worker with the lowest load among those below their
    /// bound.
    ///
    /// Ties go to the worker that registered first. `None` when every
    /// capable worker is full or none exists; [`Self::capable`] tells the two
    /// apart.
    pub fn select<F>(&self, capability: &str, load: F) -> Option<&ParticipantId>
    where
        F: Fn(&ParticipantId) -> usize,
    {
        self.capable(capability)
            .map(|w| (w, load(&w.id)))
            .filter(|(w, active)| w.has_room(*active))
            .min_by_key(|(_, active)| *active)
            .map(|(w, _)| &w.id)
    }
}
