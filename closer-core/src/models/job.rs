use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// One period-closing run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
	pub id: String,
	pub scope: Scope,
	pub status: JobStatus,
	pub created_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub last_transition_at: DateTime<Utc>,
	pub pause_requested: bool,
	pub cancel_requested: bool,
	pub total_units: u64,
	/// Aggregate produced by the processor once every unit is done.
	pub total: Option<serde_json::Value>,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Draft,
	Queued,
	Running,
	Paused,
	Completed,
	Failed,
	Cancelled,
}

impl JobStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobStatus::Draft => "draft",
			JobStatus::Queued => "queued",
			JobStatus::Running => "running",
			JobStatus::Paused => "paused",
			JobStatus::Completed => "completed",
			JobStatus::Failed => "failed",
			JobStatus::Cancelled => "cancelled",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		Some(match s {
			"draft" => JobStatus::Draft,
			"queued" => JobStatus::Queued,
			"running" => JobStatus::Running,
			"paused" => JobStatus::Paused,
			"completed" => JobStatus::Completed,
			"failed" => JobStatus::Failed,
			"cancelled" => JobStatus::Cancelled,
			_ => return None,
		})
	}

	/// No worker will ever pick the job up again from here.
	pub fn is_terminal(&self) -> bool {
		matches!(self, JobStatus::Completed | JobStatus::Cancelled)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			JobStatus::Draft => "Draft",
			JobStatus::Queued => "Queued",
			JobStatus::Running => "Running",
			JobStatus::Paused => "Paused",
			JobStatus::Completed => "Completed",
			JobStatus::Failed => "Failed",
			JobStatus::Cancelled => "Cancelled",
		};
		f.write_str(label)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_string_forms_agree_with_serde() {
		for status in [
			JobStatus::Draft,
			JobStatus::Queued,
			JobStatus::Running,
			JobStatus::Paused,
			JobStatus::Completed,
			JobStatus::Failed,
			JobStatus::Cancelled,
		] {
			let json = serde_json::to_value(status).unwrap();
			assert_eq!(json.as_str(), Some(status.as_str()));
			assert_eq!(JobStatus::parse(status.as_str()), Some(status));
		}
		assert_eq!(JobStatus::parse("archived"), None);
	}

	#[test]
	fn only_completed_and_cancelled_are_terminal() {
		assert!(JobStatus::Completed.is_terminal());
		assert!(JobStatus::Cancelled.is_terminal());
		assert!(!JobStatus::Failed.is_terminal());
		assert!(!JobStatus::Paused.is_terminal());
	}
}
