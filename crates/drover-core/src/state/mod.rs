//! Task store and state machine.
//!
//! The broker loop owns the authoritative copy of every task and enforces
//! the transition graph:
//!
//! ```text
//! queued  -> running            (task_started)
//! queued  -> failed             (dispatch send failure, reason recorded)
//! running -> completed          (completed, exit_code == 0)
//! running -> failed             (completed, exit_code != 0)
//! queued  -> completed|failed   (completed without task_started; skip tolerated)
//! ```
//!
//! Completed and Failed are terminal. Under at-least-once delivery the
//! same notification can arrive twice or out of order; anything that does
//! not fit the graph is a logged no-op, never an error. Every accepted
//! transition yields a [`TaskStatusUpdate`] for the persistence layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use drover_store::models::{Task, TaskStatus, TaskStatusUpdate};

/// Outcome of attempting a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Transition accepted; mirror this update through the store.
    Applied(TaskStatusUpdate),
    /// Late or duplicate notification for a task in `status`; nothing
    /// changed.
    Ignored { status: TaskStatus },
    /// No task with that id was ever submitted.
    UnknownTask,
}

/// Check whether `from -> to` is an edge of the transition graph.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Queued, TaskStatus::Running)
            | (TaskStatus::Queued, TaskStatus::Completed)
            | (TaskStatus::Queued, TaskStatus::Failed)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
    )
}

/// In-memory task table, authoritative for lifecycle state.
#[derive(Default)]
pub struct TaskStore {
    tasks: HashMap<Uuid, Task>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh Queued task addressed to `target`.
    pub fn create(&mut self, target: &str, mode: &str, payload: &str) -> Task {
        let task = Task::new(target, mode, payload);
        self.tasks.insert(task.id, task.clone());
        task
    }

    pub fn get(&self, id: &Uuid) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// `task_started` notification: Queued → Running.
    pub fn start(&mut self, id: Uuid) -> Transition {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Transition::UnknownTask;
        };
        if task.status != TaskStatus::Queued {
            return Transition::Ignored {
                status: task.status,
            };
        }
        let started_at = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(started_at);
        Transition::Applied(TaskStatusUpdate {
            id,
            status: TaskStatus::Running,
            started_at: Some(started_at),
            completed_at: None,
            exit_code: None,
            failure_reason: None,
        })
    }

    /// `completed` notification. Accepts Queued as well as Running: an
    /// agent may finish fast enough that its `task_started` was lost.
    pub fn complete(&mut self, id: Uuid, exit_code: i32, ts: DateTime<Utc>) -> Transition {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Transition::UnknownTask;
        };
        if task.status.is_terminal() {
            return Transition::Ignored {
                status: task.status,
            };
        }
        let status = if exit_code == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        task.status = status;
        task.completed_at = Some(ts);
        task.exit_code = Some(exit_code);
        Transition::Applied(TaskStatusUpdate {
            id,
            status,
            started_at: None,
            completed_at: Some(ts),
            exit_code: Some(exit_code),
            failure_reason: None,
        })
    }

    /// Dispatch send failure: Queued → Failed with a recorded reason.
    pub fn fail_dispatch(&mut self, id: Uuid, reason: &str) -> Transition {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Transition::UnknownTask;
        };
        if task.status != TaskStatus::Queued {
            return Transition::Ignored {
                status: task.status,
            };
        }
        let completed_at = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(completed_at);
        task.failure_reason = Some(reason.to_owned());
        Transition::Applied(TaskStatusUpdate {
            id,
            status: TaskStatus::Failed,
            started_at: None,
            completed_at: Some(completed_at),
            exit_code: None,
            failure_reason: Some(reason.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_edges() {
        use TaskStatus::*;
        assert!(is_valid_transition(Queued, Running));
        assert!(is_valid_transition(Queued, Completed));
        assert!(is_valid_transition(Queued, Failed));
        assert!(is_valid_transition(Running, Completed));
        assert!(is_valid_transition(Running, Failed));

        assert!(!is_valid_transition(Running, Queued));
        assert!(!is_valid_transition(Completed, Running));
        assert!(!is_valid_transition(Failed, Queued));
        assert!(!is_valid_transition(Completed, Failed));
    }

    #[test]
    fn success_path() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "ls -la");
        assert_eq!(task.status, TaskStatus::Queued);

        let Transition::Applied(update) = store.start(task.id) else {
            panic!("start should apply");
        };
        assert_eq!(update.status, TaskStatus::Running);
        assert!(update.started_at.is_some());

        let ts = Utc::now();
        let Transition::Applied(update) = store.complete(task.id, 0, ts) else {
            panic!("complete should apply");
        };
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(update.exit_code, Some(0));
        assert_eq!(update.completed_at, Some(ts));

        let stored = store.get(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.started_at.is_some());
    }

    #[test]
    fn nonzero_exit_fails() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "false");
        store.start(task.id);
        let Transition::Applied(update) = store.complete(task.id, 1, Utc::now()) else {
            panic!("complete should apply");
        };
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.exit_code, Some(1));
    }

    #[test]
    fn completed_straight_from_queued_is_tolerated() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "true");
        let Transition::Applied(update) = store.complete(task.id, 0, Utc::now()) else {
            panic!("skip transition should apply");
        };
        assert_eq!(update.status, TaskStatus::Completed);
        // started_at was never set.
        assert!(store.get(&task.id).unwrap().started_at.is_none());
    }

    #[test]
    fn unknown_task_is_a_no_op() {
        let mut store = TaskStore::new();
        let ghost = Uuid::new_v4();
        assert_eq!(store.start(ghost), Transition::UnknownTask);
        assert_eq!(
            store.complete(ghost, 0, Utc::now()),
            Transition::UnknownTask
        );
        assert!(store.is_empty());
    }

    #[test]
    fn terminal_state_is_monotonic() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "ls");
        store.start(task.id);
        let ts = Utc::now();
        store.complete(task.id, 0, ts);

        // Late and duplicate notifications change nothing.
        assert!(matches!(
            store.start(task.id),
            Transition::Ignored { status: TaskStatus::Completed }
        ));
        assert!(matches!(
            store.complete(task.id, 1, Utc::now()),
            Transition::Ignored { status: TaskStatus::Completed }
        ));

        let stored = store.get(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.exit_code, Some(0));
        assert_eq!(stored.completed_at, Some(ts));
    }

    #[test]
    fn duplicate_task_started_is_ignored() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "ls");
        assert!(matches!(store.start(task.id), Transition::Applied(_)));
        assert!(matches!(
            store.start(task.id),
            Transition::Ignored { status: TaskStatus::Running }
        ));
    }

    #[test]
    fn dispatch_failure_records_reason() {
        let mut store = TaskStore::new();
        let task = store.create("c1", "shell", "ls");
        let Transition::Applied(update) = store.fail_dispatch(task.id, "identity stale") else {
            panic!("fail_dispatch should apply");
        };
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.failure_reason.as_deref(), Some("identity stale"));
        assert!(update.exit_code.is_none());

        // A completion arriving afterwards is a duplicate.
        assert!(matches!(
            store.complete(task.id, 0, Utc::now()),
            Transition::Ignored { .. }
        ));
    }
}
