//! Log aggregation for one task.
//!
//! [`LogAggregate`] folds decoded events into the state a task monitor
//! displays. [`TaskLogs`] wires an aggregate to a live channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use opman_common::{LogLevel, TaskId};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{ChannelHandle, ChannelHandler, ChannelOptions, SocketState, TaskChannel};
use crate::connector::Connector;
use crate::event::TaskEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// One streamed log line. The id and timestamp are assigned on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Uuid,
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogAggregate {
    pub task_id: TaskId,
    pub entries: Vec<LogEntry>,
    pub progress_percent: u8,
    pub progress_message: Option<String>,
    pub is_connected: bool,
    pub is_complete: bool,
    pub result: Option<TaskResult>,
}

impl LogAggregate {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            entries: Vec::new(),
            progress_percent: 0,
            progress_message: None,
            is_connected: false,
            is_complete: false,
            result: None,
        }
    }

    /// Fold one event in. Returns whether anything changed.
    ///
    /// Once complete the aggregate is frozen; later events are ignored.
    pub fn apply(&mut self, event: &TaskEvent) -> bool {
        if self.is_complete {
            debug!(task_id = %self.task_id, kind = ?event.kind(), "ignoring event after completion");
            return false;
        }

        match event {
            TaskEvent::Welcome { .. } => self.set_connected(true),
            TaskEvent::Log {
                level,
                message,
                source,
            } => {
                self.entries.push(LogEntry {
                    id: Uuid::new_v4(),
                    task_id: self.task_id,
                    level: *level,
                    message: message.clone(),
                    source: source.clone(),
                    timestamp: Utc::now(),
                });
                true
            }
            TaskEvent::Progress { progress, message } => {
                self.progress_percent = *progress;
                if message.is_some() {
                    self.progress_message = message.clone();
                }
                true
            }
            TaskEvent::Completion {
                success,
                output,
                error,
            } => {
                self.is_complete = true;
                self.progress_percent = 100;
                self.result = Some(TaskResult {
                    success: *success,
                    output: output.clone(),
                    error: error.clone(),
                });
                true
            }
            TaskEvent::Unknown => false,
        }
    }

    pub fn set_connected(&mut self, connected: bool) -> bool {
        let changed = self.is_connected != connected;
        self.is_connected = connected;
        changed
    }

    /// Drop accumulated logs, progress and result. Connection status is kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.progress_percent = 0;
        self.progress_message = None;
        self.is_complete = false;
        self.result = None;
    }

    /// Entries after the first `seen`, for incremental rendering.
    pub fn entries_since(&self, seen: usize) -> &[LogEntry] {
        self.entries.get(seen..).unwrap_or(&[])
    }
}

struct View {
    aggregate: Mutex<LogAggregate>,
    revision: watch::Sender<u64>,
}

impl View {
    fn aggregate(&self) -> MutexGuard<'_, LogAggregate> {
        self.aggregate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn update(&self, f: impl FnOnce(&mut LogAggregate) -> bool) {
        let changed = {
            let mut aggregate = self.aggregate();
            f(&mut *aggregate)
        };
        if changed {
            self.bump();
        }
    }
}

struct AggregateHandler {
    view: Arc<View>,
}

impl ChannelHandler for AggregateHandler {
    fn on_message(&mut self, event: &TaskEvent) {
        self.view.update(|aggregate| aggregate.apply(event));
    }

    fn on_state_change(&mut self, state: SocketState) {
        if state == SocketState::Closed {
            self.view.update(|aggregate| aggregate.set_connected(false));
        }
    }
}

/// Live log view of one task, fed by its own channel.
pub struct TaskLogs {
    view: Arc<View>,
    channel: ChannelHandle,
}

impl TaskLogs {
    /// Open a channel for `task_id` and start aggregating its events.
    pub fn follow<C: Connector>(task_id: TaskId, options: ChannelOptions, connector: Arc<C>) -> Self {
        let (revision, _) = watch::channel(0);
        let view = Arc::new(View {
            aggregate: Mutex::new(LogAggregate::new(task_id)),
            revision,
        });
        let handler = AggregateHandler { view: view.clone() };
        let channel = TaskChannel::open(task_id, options, connector, handler);
        Self { view, channel }
    }

    pub fn task_id(&self) -> TaskId {
        self.channel.task_id()
    }

    pub fn snapshot(&self) -> LogAggregate {
        self.view.aggregate().clone()
    }

    pub fn entries_since(&self, seen: usize) -> Vec<LogEntry> {
        self.view.aggregate().entries_since(seen).to_vec()
    }

    pub fn is_complete(&self) -> bool {
        self.view.aggregate().is_complete
    }

    pub fn state(&self) -> SocketState {
        self.channel.state()
    }

    /// Revision counter bumped on every change; starts out as seen.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.view.revision.subscribe()
    }

    pub fn clear(&self) {
        self.view.aggregate().clear();
        self.view.bump();
    }

    /// Stop streaming. Accumulated entries stay readable.
    pub fn disconnect(&self) {
        self.channel.close();
        self.view.update(|aggregate| aggregate.set_connected(false));
    }

    /// Whether the channel can still deliver events.
    pub fn is_live(&self) -> bool {
        !self.channel.is_closed() && !self.channel.is_terminated() && !self.is_complete()
    }

    pub async fn terminated(&self) {
        self.channel.terminated().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(message: &str) -> TaskEvent {
        TaskEvent::log(LogLevel::Info, message, None)
    }

    fn progress(value: u8) -> TaskEvent {
        TaskEvent::Progress {
            progress: value,
            message: None,
        }
    }

    #[test]
    fn welcome_then_log() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        aggregate.apply(&TaskEvent::Welcome {
            task_id: None,
            message: None,
        });
        aggregate.apply(&TaskEvent::log(LogLevel::Info, "starting", Some("worker")));

        assert!(aggregate.is_connected);
        assert_eq!(aggregate.entries.len(), 1);
        let entry = &aggregate.entries[0];
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message, "starting");
        assert_eq!(entry.source.as_deref(), Some("worker"));
        assert_eq!(entry.task_id, TaskId(1));
    }

    #[test]
    fn entries_keep_arrival_order_with_unique_ids() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        for message in ["a", "b", "c"] {
            aggregate.apply(&log(message));
        }
        aggregate.apply(&TaskEvent::Unknown);

        let messages: Vec<_> = aggregate.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["a", "b", "c"]);
        assert_ne!(aggregate.entries[0].id, aggregate.entries[1].id);
        assert_eq!(aggregate.entries_since(2).len(), 1);
        assert!(aggregate.entries_since(10).is_empty());
    }

    #[test]
    fn progress_is_last_write_wins() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        aggregate.apply(&progress(42));
        aggregate.apply(&progress(17));
        assert_eq!(aggregate.progress_percent, 17);
    }

    #[test]
    fn progress_message_is_kept_until_replaced() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        aggregate.apply(&TaskEvent::Progress {
            progress: 10,
            message: Some("unpacking".into()),
        });
        aggregate.apply(&progress(20));
        assert_eq!(aggregate.progress_message.as_deref(), Some("unpacking"));
    }

    #[test]
    fn completion_forces_full_progress_and_freezes() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        aggregate.apply(&progress(30));
        assert!(aggregate.apply(&TaskEvent::completion(true, Some("done"), None)));

        assert!(aggregate.is_complete);
        assert_eq!(aggregate.progress_percent, 100);
        assert_eq!(
            aggregate.result,
            Some(TaskResult {
                success: true,
                output: Some("done".into()),
                error: None,
            })
        );

        assert!(!aggregate.apply(&log("late")));
        assert!(!aggregate.apply(&progress(5)));
        assert!(!aggregate.apply(&TaskEvent::completion(false, None, Some("again"))));
        assert!(aggregate.entries.is_empty());
        assert_eq!(aggregate.progress_percent, 100);
        assert_eq!(aggregate.result.as_ref().map(|r| r.success), Some(true));
    }

    #[test]
    fn clear_resets_view_but_not_connection() {
        let mut aggregate = LogAggregate::new(TaskId(1));
        aggregate.set_connected(true);
        aggregate.apply(&log("x"));
        aggregate.apply(&TaskEvent::completion(false, None, Some("boom")));

        aggregate.clear();
        assert!(aggregate.entries.is_empty());
        assert_eq!(aggregate.progress_percent, 0);
        assert!(!aggregate.is_complete);
        assert!(aggregate.result.is_none());
        assert!(aggregate.is_connected);
    }
}
