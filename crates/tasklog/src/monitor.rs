use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opman_common::TaskId;
use tracing::{debug, info};

use crate::aggregate::TaskLogs;
use crate::channel::ChannelOptions;
use crate::connector::Connector;

/// Keeps at most one live log subscription per task.
pub struct TaskMonitor<C: Connector> {
    connector: Arc<C>,
    options: ChannelOptions,
    follows: Mutex<HashMap<TaskId, Arc<TaskLogs>>>,
}

impl<C: Connector> TaskMonitor<C> {
    pub fn new(connector: Arc<C>, options: ChannelOptions) -> Self {
        Self {
            connector,
            options,
            follows: Mutex::new(HashMap::new()),
        }
    }

    fn follows(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<TaskLogs>>> {
        self.follows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live subscription for `task_id`, opening a fresh one if there
    /// is none or the previous one has finished.
    pub fn follow(&self, task_id: TaskId) -> Arc<TaskLogs> {
        let mut follows = self.follows();
        if let Some(existing) = follows.get(&task_id) {
            if existing.is_live() {
                debug!(task_id = %task_id, "reusing live task log subscription");
                return existing.clone();
            }
        }

        info!(task_id = %task_id, "following task logs");
        let logs = Arc::new(TaskLogs::follow(
            task_id,
            self.options.clone(),
            self.connector.clone(),
        ));
        if let Some(previous) = follows.insert(task_id, logs.clone()) {
            previous.disconnect();
        }
        logs
    }

    pub fn get(&self, task_id: TaskId) -> Option<Arc<TaskLogs>> {
        self.follows().get(&task_id).cloned()
    }

    /// Stop following `task_id`. Returns whether it was followed.
    pub fn unfollow(&self, task_id: TaskId) -> bool {
        let removed = self.follows().remove(&task_id);
        match removed {
            Some(logs) => {
                logs.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.follows().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Drop subscriptions that can no longer deliver events. Returns how many.
    pub fn prune_finished(&self) -> usize {
        let mut follows = self.follows();
        let before = follows.len();
        follows.retain(|_, logs| logs.is_live());
        before - follows.len()
    }

    pub fn shutdown(&self) {
        let drained: Vec<_> = self.follows().drain().collect();
        for (task_id, logs) in drained {
            debug!(task_id = %task_id, "closing task log subscription");
            logs.disconnect();
        }
    }
}

impl<C: Connector> Drop for TaskMonitor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
