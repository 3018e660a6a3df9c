//! Job record and related value types.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default retry budget for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Routing key used when a producer does not pick one.
pub const DEFAULT_ROUTING_KEY: &str = "default";

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job priority levels, in strict dequeue precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Time-sensitive work, drained before everything else.
    High,
    /// Default priority.
    Normal,
    /// Background work, drained last.
    Low,
}

impl Priority {
    /// All priorities in dequeue precedence order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Returns the string form used in queue keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Parses a priority from its string form.
    pub fn parse(s: &str) -> JobResult<Self> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(JobError::Configuration(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key partitioning queues so specialized worker fleets can drain
/// disjoint streams. At most 64 characters from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Validates and wraps a routing key.
    pub fn new(key: impl Into<String>) -> JobResult<Self> {
        let key = key.into();
        if key.is_empty() || key.len() > 64 {
            return Err(JobError::InvalidRoutingKey(key));
        }
        if !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(JobError::InvalidRoutingKey(key));
        }
        Ok(Self(key))
    }

    /// Returns true for the `"default"` key, which maps to the unrouted
    /// queue keys.
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_ROUTING_KEY
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoutingKey {
    fn default() -> Self {
        Self(DEFAULT_ROUTING_KEY.to_string())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = JobError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RoutingKey::new(s)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a priority queue.
    Pending,
    /// Waiting in the scheduled set for its run time.
    Scheduled,
    /// Leased by a worker; id sits in the processing list.
    Processing,
    /// Finished successfully.
    Completed,
    /// Retry budget exhausted; id sits in the dead-letter list.
    Failed,
}

impl JobStatus {
    /// Returns true for the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work. Serialized as JSON into `bananas:job:{id}`; the record is
/// self-describing so external tooling can scan the key pattern and
/// reconstruct queue state without the engine.
///
/// Only the queue engine mutates a record once it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job ID (UUIDv4, string form).
    pub id: JobId,

    /// Handler key.
    pub name: String,

    /// Free-form description, opaque to the engine.
    #[serde(default)]
    pub description: String,

    /// Opaque payload bytes handed to the handler.
    #[serde(default)]
    pub payload: Vec<u8>,

    /// Current status.
    pub status: JobStatus,

    /// Priority level.
    pub priority: Priority,

    /// Routing key selecting the queue partition.
    #[serde(default)]
    pub routing_key: RoutingKey,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,

    /// Next run time; present iff the job is scheduled or awaiting retry.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Completed failures so far.
    #[serde(default)]
    pub attempts: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Last error message; empty until the first failure.
    #[serde(default)]
    pub error: String,
}

impl Job {
    /// Creates a pending job with default priority, routing, and retries.
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            description: String::new(),
            payload,
            status: JobStatus::Pending,
            priority: Priority::default(),
            routing_key: RoutingKey::default(),
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: String::new(),
        }
    }

    /// Starts a builder for a job with options.
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    /// Returns true when the next failure moves the job to the dead-letter
    /// list.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for submitting jobs with options.
pub struct JobBuilder {
    name: String,
    description: String,
    payload: Vec<u8>,
    priority: Priority,
    routing_key: RoutingKey,
    scheduled_for: Option<DateTime<Utc>>,
    max_retries: u32,
}

impl JobBuilder {
    /// Creates a builder for the named handler.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            payload: Vec::new(),
            priority: Priority::default(),
            routing_key: RoutingKey::default(),
            scheduled_for: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the opaque payload.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the routing key.
    pub fn routing_key(mut self, key: RoutingKey) -> Self {
        self.routing_key = key;
        self
    }

    /// Schedules the job for a specific time.
    pub fn at(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    /// Schedules the job after a delay.
    pub fn after(mut self, delay: Duration) -> Self {
        self.scheduled_for =
            Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default());
        self
    }

    /// Overrides the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builds the job record.
    pub fn build(self) -> Job {
        let now = Utc::now();
        let status = if self.scheduled_for.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };
        Job {
            id: JobId::new(),
            name: self.name,
            description: self.description,
            payload: self.payload,
            status,
            priority: self.priority,
            routing_key: self.routing_key,
            created_at: now,
            updated_at: now,
            scheduled_for: self.scheduled_for,
            attempts: 0,
            max_retries: self.max_retries,
            error: String::new(),
        }
    }
}
