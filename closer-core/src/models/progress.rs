use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger entry for one work unit of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
	pub job_id: String,
	pub unit_key: String,
	pub sequence: u64,
	pub status: UnitStatus,
	pub attempts: u32,
	/// Failed records with this set may be claimed again.
	pub retryable: bool,
	pub owner: Option<String>,
	pub heartbeat_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
	Pending,
	InProgress,
	Done,
	Failed,
}

impl UnitStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			UnitStatus::Pending => "pending",
			UnitStatus::InProgress => "in_progress",
			UnitStatus::Done => "done",
			UnitStatus::Failed => "failed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		Some(match s {
			"pending" => UnitStatus::Pending,
			"in_progress" => UnitStatus::InProgress,
			"done" => UnitStatus::Done,
			"failed" => UnitStatus::Failed,
			_ => return None,
		})
	}
}

/// Per-status counts for one job's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
	pub total: u64,
	pub pending: u64,
	pub in_progress: u64,
	pub done: u64,
	pub failed: u64,
	/// Failed records that `next_pending` will hand out again.
	pub retryable: u64,
}

impl LedgerSummary {
	pub fn is_exhausted(&self) -> bool {
		self.total > 0 && self.done == self.total
	}
}
