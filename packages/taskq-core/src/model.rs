//! Shared data model for scrapers, periodic tasks, queue tasks and leases.
//!
//! Mirrors the entities in the orchestration runtime's design: a `Scraper` is
//! the persistent definition an operator registers, a `PeriodicTask` is the
//! uniform view the scheduler diffs against, a `Task` is one concrete queue
//! instance, and a `Lease` is a named time-bounded exclusive claim.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel used by storage backends before a task has been assigned an id.
pub const UNSET_ID: u64 = 0;

/// Relative dequeue priority. Lower value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Utmost = 0,
    High = 1,
    Normal = 2,
}

impl Priority {
    pub fn value(self) -> u64 {
        self as u64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// How a scraper or internal periodic descriptor is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// Never scheduled automatically.
    Inactive,
    EverySecond,
    EveryMinute,
    EveryHour,
    EveryDay,
    EveryWeek,
    /// Treated as a fixed 30-day interval; calendar months are not tracked.
    EveryMonth,
    /// `crontab` must carry a standard five-field crontab expression.
    Crontab,
}

/// Status of a queue task. See the orchestration state machine: terminal
/// states are `Succeeded`, `Failed`, `Dead`, `Killed`; transitions are
/// monotone and never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Dead,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Dead | TaskStatus::Killed
        )
    }
}

/// A persistent scraper definition: a named work item bound to a handler and
/// an optional periodic trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scraper {
    /// Stable identifier; immutable once created.
    pub id: String,
    pub name: String,
    pub handler: String,
    pub schedule: Schedule,
    /// Required when `schedule == Schedule::Crontab`.
    pub schedule_crontab: Option<String>,
    pub priority: Priority,
    /// Opaque payload forwarded to every enqueued task.
    pub payload: String,
    /// Timeout applied to every task instance, if set.
    pub timeout: Option<Duration>,
    /// Opaque state, written only through the handler's `update_state` callback.
    pub state: Option<String>,
    /// Arbitrary structured config handed to the handler via the context.
    pub params: Value,
    /// Per middleware-name configuration blob.
    pub middleware_config: HashMap<String, Value>,
}

impl Scraper {
    /// Validates the invariants from the data model: crontab schedules must
    /// carry a crontab expression, and a configured timeout must be positive.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.schedule, Schedule::Crontab) && self.schedule_crontab.is_none() {
            return Err(format!(
                "scraper {} has schedule=CRONTAB but no crontab expression",
                self.id
            ));
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(format!("scraper {} has a zero timeout", self.id));
            }
        }
        Ok(())
    }
}

/// Unified descriptor for something that must be enqueued on a schedule,
/// whether derived from a `Scraper` or contributed by internal housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub id: String,
    /// Uniquely identifies the logical recurring job; becomes `Task::name`.
    pub name: String,
    pub handler: String,
    pub priority: Priority,
    pub payload: String,
    pub schedule: Schedule,
    pub schedule_crontab: Option<String>,
    pub timeout: Option<Duration>,
}

/// A concrete, queueable instance of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    /// Logical task name; used to disallow concurrent instances of the same name.
    pub name: String,
    pub handler: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub payload: String,
    pub result: Option<String>,
    pub timeout: Option<Duration>,
}

impl Task {
    pub(crate) fn ordering_key(&self) -> (u64, u64) {
        (self.priority.value(), self.id)
    }
}

/// Request to enqueue a new task, carried by both the admin surface and the
/// scheduler.
#[derive(Debug, Clone)]
pub struct EnqueueTaskRequest {
    pub name: String,
    pub handler: String,
    pub priority: Priority,
    pub payload: String,
    pub timeout: Option<Duration>,
}

/// A named, time-bounded exclusive claim used for leader election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub acquired_until: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.acquired_until
    }
}
