use chrono::{DateTime, Utc};
use log::{debug, error};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::task::Task;

/// Result of offering a task to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// Already present in the scheduled or in-flight list; the offer is a
    /// no-op.
    Duplicate,
    /// The total capacity cap is reached; the caller must wait and retry.
    Full,
    /// The task has no durable record id and can never be admitted.
    Unpersisted,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub scheduled: usize,
    pub inflight: usize,
    pub groups_busy: usize,
    pub capacity: usize,
}

struct QueueState {
    scheduled: VecDeque<Task>,
    inflight: HashMap<i64, Task>,
    inflight_groups: HashSet<String>,
}

/// In-memory admission control for the worker pool.
///
/// Invariants enforced here:
/// - a task appears at most once across `scheduled` + `inflight`;
/// - `scheduled + inflight` never exceeds `max_queue_size`;
/// - at most one in-flight task per group;
/// - at most `max_inflight` tasks run concurrently.
///
/// Admission failures are ordinary outcomes, not errors: callers poll again
/// later (workers) or block on `wait_to_add` (submitters).
pub struct QueueManager {
    state: Mutex<QueueState>,
    /// Signalled when capacity frees up; blocked submitters wait on this.
    space_available: Notify,
    /// Signalled when new work may be admissible; workers wait on this.
    work_available: Notify,
    max_queue_size: usize,
    max_inflight: usize,
}

impl QueueManager {
    pub fn new(max_queue_size: usize, max_inflight: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                scheduled: VecDeque::new(),
                inflight: HashMap::new(),
                inflight_groups: HashSet::new(),
            }),
            space_available: Notify::new(),
            work_available: Notify::new(),
            max_queue_size,
            max_inflight,
        }
    }

    /// Offer a task to the scheduled list. Duplicate offers are no-ops;
    /// offers beyond the capacity cap are refused, never silently dropped.
    pub fn add_scheduled(&self, task: Task) -> EnqueueOutcome {
        let Some(id) = task.id else {
            error!("Refusing to enqueue a task without a durable record id");
            return EnqueueOutcome::Unpersisted;
        };

        {
            let mut state = self.state.lock().unwrap();

            let already_present = state.inflight.contains_key(&id)
                || state.scheduled.iter().any(|t| t.id == Some(id));
            if already_present {
                debug!("Task {id} already queued, ignoring duplicate offer");
                return EnqueueOutcome::Duplicate;
            }

            if state.scheduled.len() + state.inflight.len() >= self.max_queue_size {
                return EnqueueOutcome::Full;
            }

            state.scheduled.push_back(task);
        }

        self.work_available.notify_one();
        EnqueueOutcome::Added
    }

    /// `add_scheduled` with block-the-caller backpressure: waits for
    /// capacity instead of refusing. Returns whether the task was added
    /// (`false` means it was already present or unpersisted).
    pub async fn wait_to_add(&self, task: Task) -> bool {
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            // Register interest before checking capacity, so a release
            // between the check and the await is not missed.
            notified.as_mut().enable();

            match self.add_scheduled(task.clone()) {
                EnqueueOutcome::Added => return true,
                EnqueueOutcome::Duplicate | EnqueueOutcome::Unpersisted => return false,
                EnqueueOutcome::Full => {
                    debug!("Queue full, submitter blocked waiting for capacity");
                    notified.await;
                }
            }
        }
    }

    /// Move the next admissible task from scheduled to in-flight: the
    /// earliest-offered task that is due and whose group is free, provided
    /// the in-flight pool has headroom. Returns `None` when nothing can be
    /// admitted right now.
    pub fn next_admissible(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut state = self.state.lock().unwrap();

        if state.inflight.len() >= self.max_inflight {
            return None;
        }

        let position = state.scheduled.iter().position(|t| {
            t.is_due(now)
                && t.group_id
                    .as_ref()
                    .is_none_or(|g| !state.inflight_groups.contains(g))
        })?;

        let task = state.scheduled.remove(position)?;
        let id = task.id?;

        if let Some(group) = &task.group_id {
            state.inflight_groups.insert(group.clone());
        }
        state.inflight.insert(id, task.clone());

        debug!(
            "Admitted task {id} (group: {:?}), {} in flight",
            task.group_id,
            state.inflight.len()
        );
        Some(task)
    }

    /// Remove a task from the in-flight list and free its group if no other
    /// in-flight task shares it. Always called after an attempt finishes,
    /// whatever the outcome.
    pub fn release(&self, task: &Task) {
        let Some(id) = task.id else {
            return;
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(done) = state.inflight.remove(&id) {
                if let Some(group) = &done.group_id {
                    let group_still_busy = state
                        .inflight
                        .values()
                        .any(|t| t.group_id.as_deref() == Some(group.as_str()));
                    if !group_still_busy {
                        state.inflight_groups.remove(group);
                    }
                }
                debug!("Released task {id}, {} in flight", state.inflight.len());
            }
        }

        self.space_available.notify_waiters();
        // A same-group task may have become admissible.
        self.work_available.notify_one();
    }

    /// Earliest `scheduled_at` among queued tasks; workers use this to size
    /// their sleep.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state.scheduled.iter().map(|t| t.scheduled_at).min()
    }

    /// Wait until new work may be admissible.
    pub async fn work_available(&self) {
        self.work_available.notified().await;
    }

    pub fn contains(&self, id: i64) -> bool {
        let state = self.state.lock().unwrap();
        state.inflight.contains_key(&id) || state.scheduled.iter().any(|t| t.id == Some(id))
    }

    pub fn scheduled_len(&self) -> usize {
        self.state.lock().unwrap().scheduled.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().unwrap().inflight.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            scheduled: state.scheduled.len(),
            inflight: state.inflight.len(),
            groups_busy: state.inflight_groups.len(),
            capacity: self.max_queue_size,
        }
    }
}
