//! Persisted job rows. Status changes are compare-and-set on the current
//! status, so two racing writers can never both win the same transition.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::{
	db::DbHandle,
	models::{Job, JobStatus, Scope},
};

#[derive(Debug, Error)]
pub enum JobStoreError {
	#[error("database error: {0}")]
	DbError(String),

	#[error("corrupt job record {job_id}: {reason}")]
	Corrupt { job_id: String, reason: String },
}

fn db_err(e: impl ToString) -> JobStoreError {
	JobStoreError::DbError(e.to_string())
}

/// Extra fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
	pub started_at: Option<DateTime<Utc>>,
	pub pause_requested: Option<bool>,
	pub cancel_requested: Option<bool>,
	pub total: Option<serde_json::Value>,
	/// `Some(None)` clears the error.
	pub last_error: Option<Option<String>>,
}

impl JobPatch {
	pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
		self.started_at = Some(at);
		self
	}

	pub fn pause_requested(mut self, value: bool) -> Self {
		self.pause_requested = Some(value);
		self
	}

	pub fn cancel_requested(mut self, value: bool) -> Self {
		self.cancel_requested = Some(value);
		self
	}

	pub fn total(mut self, total: serde_json::Value) -> Self {
		self.total = Some(total);
		self
	}

	pub fn error(mut self, error: impl Into<String>) -> Self {
		self.last_error = Some(Some(error.into()));
		self
	}

	pub fn clear_error(mut self) -> Self {
		self.last_error = Some(None);
		self
	}
}

#[derive(Debug, Deserialize)]
struct JobRow {
	key: String,
	scope: String,
	status: String,
	created_at: i64,
	#[serde(default)]
	started_at: Option<i64>,
	last_transition_at: i64,
	#[serde(default)]
	pause_requested: bool,
	#[serde(default)]
	cancel_requested: bool,
	#[serde(default)]
	total_units: i64,
	#[serde(default)]
	total: Option<String>,
	#[serde(default)]
	last_error: Option<String>,
}

impl JobRow {
	fn into_job(self) -> Result<Job, JobStoreError> {
		let corrupt = |reason: String| JobStoreError::Corrupt { job_id: self.key.clone(), reason };

		let scope: Scope = serde_json::from_str(&self.scope).map_err(|e| corrupt(format!("bad scope: {e}")))?;
		let status = JobStatus::parse(&self.status).ok_or_else(|| corrupt(format!("unknown status {}", self.status)))?;
		let total = match &self.total {
			Some(text) => Some(serde_json::from_str(text).map_err(|e| corrupt(format!("bad total: {e}")))?),
			None => None,
		};
		let created_at = DateTime::from_timestamp_millis(self.created_at)
			.ok_or_else(|| corrupt(format!("bad created_at {}", self.created_at)))?;
		let last_transition_at = DateTime::from_timestamp_millis(self.last_transition_at)
			.ok_or_else(|| corrupt(format!("bad last_transition_at {}", self.last_transition_at)))?;

		Ok(Job {
			id: self.key,
			scope,
			status,
			created_at,
			started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
			last_transition_at,
			pause_requested: self.pause_requested,
			cancel_requested: self.cancel_requested,
			total_units: self.total_units.max(0) as u64,
			total,
			last_error: self.last_error,
		})
	}
}

fn parse_jobs(rows: Vec<serde_json::Value>) -> Result<Vec<Job>, JobStoreError> {
	rows.into_iter()
		.map(|row| {
			let row: JobRow = serde_json::from_value(row).map_err(db_err)?;
			row.into_job()
		})
		.collect()
}

#[derive(Clone)]
pub struct JobStore {
	db: DbHandle,
}

impl JobStore {
	pub fn new(db: DbHandle) -> Self {
		Self { db }
	}

	/// Persist a new Draft job.
	pub async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
		let scope = serde_json::to_string(&job.scope).map_err(db_err)?;
		self.db
			.db
			.query(
				"CREATE job CONTENT {
                    key: $key,
                    scope: $scope,
                    status: $status,
                    created_at: $created_at,
                    last_transition_at: $created_at,
                    pause_requested: false,
                    cancel_requested: false,
                    total_units: $total_units,
                }",
			)
			.bind(("key", job.id.clone()))
			.bind(("scope", scope))
			.bind(("status", job.status.as_str().to_string()))
			.bind(("created_at", job.created_at.timestamp_millis()))
			.bind(("total_units", job.total_units as i64))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;
		Ok(())
	}

	pub async fn get(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query("SELECT * OMIT id FROM job WHERE key = $key")
			.bind(("key", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(parse_jobs(rows)?.into_iter().next())
	}

	pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query("SELECT * OMIT id FROM job WHERE status = $status ORDER BY created_at ASC")
			.bind(("status", status.as_str().to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		parse_jobs(rows)
	}

	pub async fn list(&self) -> Result<Vec<Job>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query("SELECT * OMIT id FROM job ORDER BY created_at ASC")
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		parse_jobs(rows)
	}

	/// Move `job_id` from `from` to `to`, writing `patch` in the same
	/// statement. Returns the updated job, or `None` if the job was not in
	/// `from` any more.
	pub async fn transition(
		&self,
		job_id: &str,
		from: JobStatus,
		to: JobStatus,
		patch: JobPatch,
	) -> Result<Option<Job>, JobStoreError> {
		let mut sets = vec!["status = $to", "last_transition_at = $now"];
		if patch.started_at.is_some() {
			sets.push("started_at = $started_at");
		}
		if patch.pause_requested.is_some() {
			sets.push("pause_requested = $pause_requested");
		}
		if patch.cancel_requested.is_some() {
			sets.push("cancel_requested = $cancel_requested");
		}
		if patch.total.is_some() {
			sets.push("total = $total");
		}
		match &patch.last_error {
			Some(Some(_)) => sets.push("last_error = $last_error"),
			Some(None) => sets.push("last_error = NONE"),
			None => {}
		}

		let total = match &patch.total {
			Some(v) => serde_json::to_string(v).map_err(db_err)?,
			None => String::new(),
		};

		let mut response = self
			.db
			.db
			.query(format!("UPDATE job SET {} WHERE key = $key AND status = $from RETURN AFTER", sets.join(", ")))
			.bind(("key", job_id.to_string()))
			.bind(("from", from.as_str().to_string()))
			.bind(("to", to.as_str().to_string()))
			.bind(("now", Utc::now().timestamp_millis()))
			.bind(("started_at", patch.started_at.map(|t| t.timestamp_millis()).unwrap_or_default()))
			.bind(("pause_requested", patch.pause_requested.unwrap_or_default()))
			.bind(("cancel_requested", patch.cancel_requested.unwrap_or_default()))
			.bind(("total", total))
			.bind(("last_error", patch.last_error.clone().flatten().unwrap_or_default()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(parse_jobs(rows)?.into_iter().next())
	}

	/// Set a control flag while the job is in `status`. Returns the updated
	/// job, or `None` if the status no longer matches.
	pub async fn request_pause(&self, job_id: &str, status: JobStatus) -> Result<Option<Job>, JobStoreError> {
		self.set_flag(job_id, "pause_requested", status).await
	}

	pub async fn request_cancel(&self, job_id: &str, status: JobStatus) -> Result<Option<Job>, JobStoreError> {
		self.set_flag(job_id, "cancel_requested", status).await
	}

	async fn set_flag(&self, job_id: &str, flag: &str, status: JobStatus) -> Result<Option<Job>, JobStoreError> {
		let mut response = self
			.db
			.db
			.query(format!("UPDATE job SET {flag} = true WHERE key = $key AND status = $status RETURN AFTER"))
			.bind(("key", job_id.to_string()))
			.bind(("status", status.as_str().to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(parse_jobs(rows)?.into_iter().next())
	}

	/// Replace the scope of a Draft job. `None` when the job is not a draft.
	pub async fn update_scope(&self, job_id: &str, scope: &Scope, total_units: u64) -> Result<Option<Job>, JobStoreError> {
		let text = serde_json::to_string(scope).map_err(db_err)?;
		let mut response = self
			.db
			.db
			.query(
				"UPDATE job SET scope = $scope, total_units = $total_units
                 WHERE key = $key AND status = 'draft' RETURN AFTER",
			)
			.bind(("key", job_id.to_string()))
			.bind(("scope", text))
			.bind(("total_units", total_units as i64))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(parse_jobs(rows)?.into_iter().next())
	}
}
