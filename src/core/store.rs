//! Task graph store.
//!
//! The authoritative map from task id to task record. Tasks are kept in an
//! id-indexed arena: parents and children refer to each other by id only, so
//! walking the tree never needs owning references. A reverse dependency index
//! answers "who is waiting on this task" without scanning.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::transport::ParticipantId;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    /// Creation order, for deterministic listing.
    order: Vec<TaskId>,
    /// dependency id -> tasks that declared it in `depends_on`.
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the id is already present.
    pub fn insert(&mut self, task: Task) -> Result<TaskId> {
        let id = task.id;
        if self.tasks.contains_key(&id) {
            return Err(Error::Validation(format!("Task {} already exists", id)));
        }
        for dep in &task.depends_on {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.order.push(id);
        self.tasks.insert(id, task);
        Ok(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Like `get`, but a missing task is an error.
    pub fn require(&self, id: &TaskId) -> Result<&Task> {
        self.tasks.get(id).ok_or(Error::TaskNotFound(*id))
    }

    pub fn require_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// All tasks in creation order.
    pub fn all(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.all().filter(|t| t.status == status).collect()
    }

    /// Every task ever assigned to `worker`, in creation order.
    pub fn by_worker(&self, worker: &ParticipantId) -> Vec<&Task> {
        self.all()
            .filter(|t| t.assigned_worker.as_ref() == Some(worker))
            .collect()
    }

    /// Children of `parent` in decomposition order.
    pub fn by_parent(&self, parent: &TaskId) -> Vec<&Task> {
        self.tasks
            .get(parent)
            .map(|p| {
                p.child_ids
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks without a parent, in creation order.
    pub fn roots(&self) -> Vec<&Task> {
        self.all().filter(|t| t.is_root()).collect()
    }

    /// Tasks that declared `id` as a dependency.
    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of tasks currently Assigned or Running on `worker`.
    pub fn active_load(&self, worker: &ParticipantId) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_active() && t.assigned_worker.as_ref() == Some(worker))
            .count()
    }

    /// Whether every dependency of `id` is Completed.
    pub fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        self.tasks.get(id).is_some_and(|task| {
            task.depends_on
                .iter()
                .all(|dep| self.status(dep) == Some(TaskStatus::Completed))
        })
    }

    /// Whether `id` and every ancestor have their dependencies satisfied.
    ///
    /// A leaf inside a decomposed task inherits that task's prerequisites.
    pub fn released(&self, id: &TaskId) -> bool {
        let mut current = Some(*id);
        while let Some(task_id) = current {
            if !self.dependencies_satisfied(&task_id) {
                return false;
            }
            current = self.tasks.get(&task_id).and_then(|t| t.parent_id);
        }
        true
    }

    /// Number of edges between `id` and its root.
    pub fn depth(&self, id: &TaskId) -> usize {
        let mut depth = 0;
        let mut current = self.tasks.get(id).and_then(|t| t.parent_id);
        while let Some(parent) = current {
            depth += 1;
            current = self.tasks.get(&parent).and_then(|t| t.parent_id);
        }
        depth
    }

    /// `id` and all of its descendants, breadth-first.
    pub fn subtree(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        if !self.tasks.contains_key(id) {
            return out;
        }
        let mut frontier = std::collections::VecDeque::from([*id]);
        while let Some(next) = frontier.pop_front() {
            out.push(next);
            if let Some(task) = self.tasks.get(&next) {
                frontier.extend(task.child_ids.iter().copied());
            }
        }
        out
    }

    /// Remove a finished tree.
    ///
    /// Only whole trees whose root is terminal can be pruned, so no
    /// non-terminal ancestor ever loses a descendant. Returns the number of
    /// tasks removed.
    pub fn prune_tree(&mut self, root: &TaskId) -> Result<usize> {
        let task = self.require(root)?;
        if !task.is_root() {
            return Err(Error::Validation(format!("Task {} is not a root", root)));
        }
        if !task.is_finished() {
            return Err(Error::Validation(format!(
                "Task {} is still {}",
                root, task.status
            )));
        }

        let ids: HashSet<TaskId> = self.subtree(root).into_iter().collect();
        for id in &ids {
            self.tasks.remove(id);
            self.dependents.remove(id);
        }
        self.order.retain(|id| !ids.contains(id));
        Ok(ids.len())
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks.len())
            .field("roots", &self.roots().len())
            .finish()
    }
}
