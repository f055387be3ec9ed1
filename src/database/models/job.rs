//! Job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Job status values.
///
/// The schema invariant is `finished_at IS NULL <=> status is PENDING or
/// RUNNING`; the repository helpers maintain it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued and waiting for the scheduler to pick it up.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error; `error` is set.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One invocation of a source.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: i64,
    pub source_id: i64,
    pub status: String,
    /// Set iff the terminal status is FAILED.
    pub error: Option<String>,
    pub created_at: i64,
    /// Set when the job transitions to RUNNING.
    pub run_at: Option<i64>,
    /// Set on any terminal transition.
    pub finished_at: Option<i64>,
}

impl JobDbModel {
    pub fn new(source_id: i64) -> Self {
        Self {
            id: 0,
            source_id,
            status: JobStatus::Pending.as_str().to_string(),
            error: None,
            created_at: time::now_ms(),
            run_at: None,
            finished_at: None,
        }
    }

    pub fn get_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}
