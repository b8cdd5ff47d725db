//! Job, attempt, and lifecycle-event types.
//!
//! These mirror the two durable tables (`jobs`, `job_attempts`) and the
//! ephemeral event objects broadcast to subscribers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Unique identifier for a job.
pub type JobId = Uuid;

/// Lifecycle state of a job or of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed and currently executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget (or failed an individual attempt).
    Failed,
    /// Cancelled by an admin; never leaves this state.
    Cancelled,
}

impl JobStatus {
    /// The lowercase wire and column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidStatus(other.to_owned())),
        }
    }
}

/// Scheduling priority. Higher priorities are claimed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Claimed only when nothing else is eligible.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Claimed before everything else.
    High,
}

impl JobPriority {
    /// The lowercase wire and column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            other => Err(Error::InvalidPriority(other.to_owned())),
        }
    }
}

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// Logical routing label; handlers are looked up by queue name.
    pub queue: String,
    /// Opaque JSON payload, never inspected by the core.
    pub payload: Value,
    /// Number of retries after the first failure. Zero means fail fast.
    pub max_retries: i32,
    /// The job is ineligible for claim before this instant.
    pub run_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Scheduling priority.
    pub priority: JobPriority,
    /// Caller-supplied deduplication token.
    pub idempotency_key: Option<String>,
    /// Worker currently holding the job, when `status` is `processing`.
    pub locked_by: Option<String>,
    /// Instant the current lease was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Maintained by the store.
    pub created_at: DateTime<Utc>,
    /// Maintained by the store.
    pub updated_at: DateTime<Utc>,
}

/// One durable record per handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    /// Unique identifier.
    pub id: Uuid,
    /// The job this attempt belongs to.
    pub job_id: JobId,
    /// Monotone per job, starting at 1.
    pub attempt_number: i32,
    /// Instant the handler was invoked.
    pub started_at: DateTime<Utc>,
    /// Instant the attempt reached a terminal outcome.
    pub completed_at: Option<DateTime<Utc>>,
    /// `processing` while running, then `completed` or `failed`.
    pub status: JobStatus,
    /// Present when the attempt failed.
    pub error_message: Option<String>,
}

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The job was durably inserted.
    Created,
    /// A worker claimed the job and is about to run the handler.
    Started,
    /// The handler returned success and the job is completed.
    Succeeded,
    /// An attempt failed (possibly the terminal one).
    Failed,
    /// A failed job was rescheduled for another attempt.
    RetryScheduled,
    /// The job was cancelled by an admin.
    Cancelled,
}

/// An ephemeral lifecycle event broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Kind of event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The job the event concerns.
    pub job_id: JobId,
    /// Queue of that job.
    pub queue: String,
    /// Instant of emission.
    pub timestamp: DateTime<Utc>,
    /// The job payload, omitted when null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error message, present on `failed` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Scheduled instant of the next attempt, present on `retry_scheduled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobEvent {
    fn base(event_type: EventType, job: &Job) -> Self {
        JobEvent {
            event_type,
            job_id: job.id,
            queue: job.queue.clone(),
            timestamp: Utc::now(),
            payload: (!job.payload.is_null()).then(|| job.payload.clone()),
            error: None,
            run_at: None,
        }
    }

    /// The job was durably inserted.
    pub fn created(job: &Job) -> Self {
        Self::base(EventType::Created, job)
    }

    /// A worker claimed the job.
    pub fn started(job: &Job) -> Self {
        Self::base(EventType::Started, job)
    }

    /// The handler returned success.
    pub fn succeeded(job: &Job) -> Self {
        Self::base(EventType::Succeeded, job)
    }

    /// An attempt failed.
    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        JobEvent {
            error: Some(error.into()),
            ..Self::base(EventType::Failed, job)
        }
    }

    /// The job was rescheduled, carrying the instant of the next attempt.
    pub fn retry_scheduled(job: &Job, run_at: DateTime<Utc>) -> Self {
        JobEvent {
            run_at: Some(run_at),
            ..Self::base(EventType::RetryScheduled, job)
        }
    }

    /// The job was cancelled.
    pub fn cancelled(job: &Job) -> Self {
        Self::base(EventType::Cancelled, job)
    }

    /// Wire encoding; falls back to a static error object so broadcast paths
    /// never have to handle serialization failures.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"error":"failed to serialize event"}"#.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job {
            id: Uuid::nil(),
            queue: "default".to_owned(),
            payload: json!({"x": 1}),
            max_retries: 3,
            run_at: Utc::now(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            idempotency_key: None,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn event_wire_format_omits_absent_fields() {
        let event = JobEvent::started(&sample_job());
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["type"], json!("started"));
        assert_eq!(object["payload"], json!({"x": 1}));
        assert!(!object.contains_key("error"));
        assert!(!object.contains_key("run_at"));
    }

    #[test]
    fn failed_event_carries_error() {
        let event = JobEvent::failed(&sample_job(), "boom");
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], json!("failed"));
        assert_eq!(value["error"], json!("boom"));
    }

    #[test]
    fn retry_event_carries_schedule() {
        let run_at = Utc::now();
        let event = JobEvent::retry_scheduled(&sample_job(), run_at);
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], json!("retry_scheduled"));
        assert!(value.get("run_at").is_some());
    }

    #[test]
    fn null_payload_is_omitted() {
        let mut job = sample_job();
        job.payload = Value::Null;
        let value: Value = serde_json::from_str(&JobEvent::created(&job).to_json()).unwrap();
        assert!(value.get("payload").is_none());
    }
}
