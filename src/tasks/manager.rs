//! Single-flight slots for the background workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{TaskId, TaskType};

/// A running background task.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub cancel_flag: Arc<AtomicBool>,
    pub started_at: Instant,
}

impl BackgroundTask {
    /// Request cancellation of this task.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Get elapsed time since task started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

type Slots = Arc<Mutex<HashMap<TaskType, BackgroundTask>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<TaskType, BackgroundTask>> {
    // A panicking worker must not wedge its slot.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks at most one running task per `TaskType`.
#[derive(Clone, Default)]
pub struct BackgroundTaskManager {
    slots: Slots,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `task_type`. Returns `None` while another task of
    /// that type is running; the request is dropped, not queued.
    pub fn register(&self, task_type: TaskType) -> Option<TaskTicket> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&task_type) {
            return None;
        }

        let task = BackgroundTask {
            id: TaskId::new(),
            task_type,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        };
        let ticket = TaskTicket {
            id: task.id,
            task_type,
            cancel_flag: task.cancel_flag.clone(),
            slots: self.slots.clone(),
        };
        slots.insert(task_type, task);
        Some(ticket)
    }

    /// Check if a task of the given type is already running.
    pub fn is_running(&self, task_type: TaskType) -> bool {
        lock(&self.slots).contains_key(&task_type)
    }

    /// Request cancellation of the running task of `task_type`.
    pub fn cancel(&self, task_type: TaskType) -> bool {
        match lock(&self.slots).get(&task_type) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel all running tasks.
    pub fn cancel_all(&self) {
        for task in lock(&self.slots).values() {
            task.cancel();
        }
    }

    /// Snapshot of running tasks, oldest first.
    pub fn running_tasks(&self) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = lock(&self.slots).values().cloned().collect();
        tasks.sort_by_key(|t| (t.started_at, t.id.0));
        tasks
    }

    pub fn has_running_tasks(&self) -> bool {
        !lock(&self.slots).is_empty()
    }
}

/// Proof of a claimed slot. Dropping it frees the slot.
pub struct TaskTicket {
    id: TaskId,
    task_type: TaskType,
    cancel_flag: Arc<AtomicBool>,
    slots: Slots,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel_flag
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if slots.get(&self.task_type).map(|t| t.id) == Some(self.id) {
            slots.remove(&self.task_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_registration_is_rejected() {
        let manager = BackgroundTaskManager::new();

        let ticket = manager.register(TaskType::Scan).unwrap();
        assert!(manager.is_running(TaskType::Scan));
        assert!(manager.register(TaskType::Scan).is_none());

        // Other types are independent.
        let cluster = manager.register(TaskType::Cluster);
        assert!(cluster.is_some());

        drop(ticket);
        assert!(!manager.is_running(TaskType::Scan));
        assert!(manager.register(TaskType::Scan).is_some());
    }

    #[test]
    fn test_cancel_reaches_ticket() {
        let manager = BackgroundTaskManager::new();
        let ticket = manager.register(TaskType::Cluster).unwrap();

        assert!(!ticket.is_cancelled());
        assert!(manager.cancel(TaskType::Cluster));
        assert!(ticket.is_cancelled());
        assert!(!manager.cancel(TaskType::Scan));
    }

    #[test]
    fn test_running_tasks_snapshot() {
        let manager = BackgroundTaskManager::new();
        assert!(!manager.has_running_tasks());

        let _scan = manager.register(TaskType::Scan).unwrap();
        let _cluster = manager.register(TaskType::Cluster).unwrap();

        let running = manager.running_tasks();
        assert_eq!(running.len(), 2);
        assert_eq!(running[0].task_type, TaskType::Scan);

        manager.cancel_all();
        assert!(running.iter().all(|t| t.cancel_flag.load(Ordering::SeqCst)));
    }
}
