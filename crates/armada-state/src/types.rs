use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new, time-ordered job ID.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a job as persisted in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Pending | Self::Running => false,
            Self::Completed | Self::Failed | Self::Cancelled => true,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown job state: {s}")),
        }
    }
}

/// Status of a resource allocation.
///
/// Only `Allocated` counts toward the cached committed-CPU counter. A
/// `Reserved` row is a ledger-only hold that was never charged to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Reserved,
    Allocated,
    Released,
}

impl AllocationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Allocated => "allocated",
            Self::Released => "released",
        }
    }

    pub const fn is_live(self) -> bool {
        match self {
            Self::Reserved | Self::Allocated => true,
            Self::Released => false,
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "allocated" => Ok(Self::Allocated),
            "released" => Ok(Self::Released),
            _ => Err(format!("unknown allocation status: {s}")),
        }
    }
}

/// What a submitter hands over when creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub cpus_required: u32,
    /// Shell script (or a path to one) run by the executor.
    pub script: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Duration>,
}

impl JobSpec {
    pub fn new(cpus_required: u32, script: impl Into<String>) -> Self {
        Self {
            cpus_required,
            script: script.into(),
            environment: BTreeMap::new(),
            time_limit: None,
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cpus_required == 0 {
            return Err("cpus_required must be at least 1".to_owned());
        }
        if self.script.trim().is_empty() {
            return Err("script must not be empty".to_owned());
        }
        Ok(())
    }
}

/// A job row in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_msg: Option<String>,
}

impl JobRecord {
    pub fn pending(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            state: JobState::Pending,
            submitted_at: Utc::now(),
            start_time: None,
            end_time: None,
            exit_code: None,
            error_msg: None,
        }
    }
}

/// A resource allocation row in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: i64,
    pub job_id: JobId,
    pub allocated_cpus: u32,
    pub status: AllocationStatus,
    /// When the reservation was made.
    pub allocation_time: DateTime<Utc>,
    /// When the executor promoted the row to allocated.
    pub allocated_time: Option<DateTime<Utc>>,
    pub released_time: Option<DateTime<Utc>>,
    /// Leader of the job's process group. Only meaningful on `process_host`.
    pub process_id: Option<u32>,
    /// Host the process was spawned on.
    pub process_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub attempt: u32,
    pub enqueued_at: SystemTime,
}
