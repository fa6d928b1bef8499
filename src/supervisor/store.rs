//! Concurrent task store
//!
//! Each task lives in one map entry; every mutation goes through the entry's
//! shard lock, so writes to a given task id are serialized.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use super::task::{TaskEvent, TaskPhase, TaskStatus, TaskView};
use crate::core::cancel::CancelHandle;

struct TaskEntry {
    view: TaskView,
    phase: Option<TaskPhase>,
    events: VecDeque<TaskEvent>,
    cancel: CancelHandle,
    status_tx: watch::Sender<TaskStatus>,
}

#[derive(Clone)]
pub struct TaskStore {
    tasks: Arc<DashMap<String, TaskEntry>>,
    event_capacity: usize,
}

impl TaskStore {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            event_capacity: event_capacity.max(1),
        }
    }

    pub fn insert(&self, view: TaskView) -> CancelHandle {
        let cancel = CancelHandle::new();
        let (status_tx, _) = watch::channel(view.status);
        let id = view.id.clone();
        let mut entry = TaskEntry {
            view,
            phase: None,
            events: VecDeque::with_capacity(self.event_capacity.min(64)),
            cancel: cancel.clone(),
            status_tx,
        };
        push_bounded(&mut entry.events, self.event_capacity, TaskEvent::new("submitted", ""));
        self.tasks.insert(id, entry);
        cancel
    }

    /// Snapshot including the event log
    pub fn view(&self, id: &str) -> Option<TaskView> {
        self.tasks.get(id).map(|entry| {
            let mut view = entry.view.clone();
            view.events = entry.events.iter().cloned().collect();
            view
        })
    }

    /// Snapshots of every task, without event logs
    pub fn views(&self) -> Vec<TaskView> {
        self.tasks.iter().map(|entry| entry.view.clone()).collect()
    }

    pub fn phase(&self, id: &str) -> Option<TaskPhase> {
        self.tasks.get(id).and_then(|entry| entry.phase)
    }

    pub fn cancel_handle(&self, id: &str) -> Option<CancelHandle> {
        self.tasks.get(id).map(|entry| entry.cancel.clone())
    }

    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<TaskStatus>> {
        self.tasks.get(id).map(|entry| entry.status_tx.subscribe())
    }

    /// Mutate the task's non-status fields
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskView),
    {
        match self.tasks.get_mut(id) {
            Some(mut entry) => {
                f(&mut entry.view);
                true
            }
            None => false,
        }
    }

    pub fn set_phase(&self, id: &str, phase: TaskPhase) {
        if let Some(mut entry) = self.tasks.get_mut(id) {
            entry.phase = Some(phase);
        }
    }

    pub fn record_event(&self, id: &str, event: TaskEvent) {
        if let Some(mut entry) = self.tasks.get_mut(id) {
            push_bounded(&mut entry.events, self.event_capacity, event);
        }
    }

    /// Apply a status transition, refusing ones the state machine forbids.
    ///
    /// `f` runs under the same lock, so terminal payloads land together with
    /// the status that makes them visible.
    pub fn transition<F>(&self, id: &str, next: TaskStatus, f: F) -> bool
    where
        F: FnOnce(&mut TaskView),
    {
        let Some(mut entry) = self.tasks.get_mut(id) else {
            return false;
        };
        let current = entry.view.status;
        if !current.can_transition_to(next) {
            warn!(task_id = id, "Ignoring transition {} -> {}", current, next);
            return false;
        }

        let now = Utc::now();
        entry.view.status = next;
        match next {
            TaskStatus::Running => entry.view.started_at = Some(now),
            _ if next.is_terminal() => {
                entry.view.completed_at = Some(now);
                entry.phase = None;
            }
            _ => {}
        }
        f(&mut entry.view);
        let detail = entry
            .view
            .failure
            .as_ref()
            .filter(|_| next.is_terminal())
            .map(|failure| failure.to_string())
            .unwrap_or_default();
        let capacity = self.event_capacity;
        push_bounded(
            &mut entry.events,
            capacity,
            TaskEvent::new(format!("status:{}", next), detail),
        );
        entry.status_tx.send_replace(next);
        true
    }
}

fn push_bounded(events: &mut VecDeque<TaskEvent>, capacity: usize, event: TaskEvent) {
    while events.len() >= capacity {
        events.pop_front();
    }
    events.push_back(event);
}
