//! Durable per-unit checkpoint store.
//!
//! Every mutation is a single conditional `UPDATE` so concurrent workers can
//! share a job: a claim only lands when the record is still eligible, and
//! nothing ever moves a record out of `done`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	db::DbHandle,
	engine::enumerator,
	models::{LedgerSummary, ProgressRecord, Scope, UnitStatus},
};

/// Lost compare-and-set races are retried this many times before giving up.
const CLAIM_RETRY_LIMIT: usize = 16;

// Pending, retryable failed, or an in-progress claim gone quiet.
const ELIGIBLE: &str = "(status = 'pending'
    OR (status = 'failed' AND retryable = true)
    OR (status = 'in_progress' AND heartbeat_at < $stale_before))";

// Outcomes only land on a claim the caller still holds.
const HELD_BY_OWNER: &str = "AND status = 'in_progress' AND owner = $owner";

#[derive(Debug, Error)]
pub enum LedgerError {
	#[error("database error: {0}")]
	DbError(String),

	#[error("corrupt progress record {unit_key}: {reason}")]
	Corrupt { unit_key: String, reason: String },

	#[error("claim for job {job_id} kept conflicting: {last_error}")]
	ClaimContention { job_id: String, last_error: String },
}

/// A unit handed to one owner by [`ProgressLedger::next_pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedUnit {
	pub unit_key: String,
	pub sequence: u64,
	/// Attempt number of this claim, 1-based.
	pub attempts: u32,
	/// Previous owner when the claim was taken over from a stale record.
	pub reclaimed_from: Option<String>,
}

#[derive(Clone)]
pub struct ProgressLedger {
	db: DbHandle,
	staleness: chrono::Duration,
}

#[derive(Debug, Deserialize)]
struct ProgressRow {
	job_id: String,
	unit_key: String,
	sequence: i64,
	status: String,
	#[serde(default)]
	attempts: i64,
	#[serde(default)]
	retryable: bool,
	#[serde(default)]
	owner: Option<String>,
	#[serde(default)]
	heartbeat_at: Option<i64>,
	#[serde(default)]
	completed_at: Option<i64>,
	#[serde(default)]
	last_error: Option<String>,
	#[serde(default)]
	output: Option<String>,
}

impl ProgressRow {
	fn into_record(self) -> Result<ProgressRecord, LedgerError> {
		let corrupt = |reason: String| LedgerError::Corrupt { unit_key: self.unit_key.clone(), reason };

		let status = UnitStatus::parse(&self.status).ok_or_else(|| corrupt(format!("unknown status {}", self.status)))?;
		let output = match &self.output {
			Some(text) => Some(serde_json::from_str(text).map_err(|e| corrupt(format!("bad output: {e}")))?),
			None => None,
		};

		Ok(ProgressRecord {
			job_id: self.job_id,
			unit_key: self.unit_key,
			sequence: self.sequence.max(0) as u64,
			status,
			attempts: self.attempts.max(0) as u32,
			retryable: self.retryable,
			owner: self.owner,
			heartbeat_at: self.heartbeat_at.and_then(DateTime::from_timestamp_millis),
			completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
			last_error: self.last_error,
			output,
		})
	}
}

fn db_err(e: impl ToString) -> LedgerError {
	LedgerError::DbError(e.to_string())
}

fn parse_rows(rows: Vec<serde_json::Value>) -> Result<Vec<ProgressRecord>, LedgerError> {
	rows.into_iter()
		.map(|row| {
			let row: ProgressRow = serde_json::from_value(row).map_err(db_err)?;
			row.into_record()
		})
		.collect()
}

impl ProgressLedger {
	pub fn new(db: DbHandle, staleness: chrono::Duration) -> Self {
		Self { db, staleness }
	}

	pub fn staleness(&self) -> chrono::Duration {
		self.staleness
	}

	/// Write a pending record for every unit of `scope` that has none yet.
	/// Returns how many were created.
	pub async fn seed(&self, job_id: &str, scope: &Scope) -> Result<u64, LedgerError> {
		let mut response = self
			.db
			.db
			.query("SELECT unit_key FROM progress WHERE job_id = $job_id")
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		let existing: HashSet<String> =
			rows.iter().filter_map(|r| r["unit_key"].as_str().map(str::to_string)).collect();

		let mut created = 0u64;
		for unit in enumerator::enumerate(scope) {
			if existing.contains(&unit.key) {
				continue;
			}
			let result = self
				.db
				.db
				.query(
					"CREATE progress CONTENT {
                        job_id: $job_id,
                        unit_key: $unit_key,
                        sequence: $sequence,
                        status: 'pending',
                        attempts: 0,
                        retryable: false,
                    }",
				)
				.bind(("job_id", job_id.to_string()))
				.bind(("unit_key", unit.key.clone()))
				.bind(("sequence", unit.sequence as i64))
				.await
				.and_then(|r| r.check());

			match result {
				Ok(_) => created += 1,
				// A concurrent seeder got there first: the unique index rejected ours.
				Err(e) => {
					if self.record(job_id, &unit.key).await?.is_none() {
						return Err(db_err(e));
					}
				}
			}
		}

		if created > 0 {
			debug!(job_id, created, "seeded progress records");
		}
		Ok(created)
	}

	/// Claim the lowest-sequence eligible unit for `owner`.
	///
	/// `None` means nothing is claimable right now; use [`Self::summary`] to
	/// tell exhaustion from failed units or a fresh claim held elsewhere.
	pub async fn next_pending(&self, job_id: &str, owner: &str) -> Result<Option<ClaimedUnit>, LedgerError> {
		let mut last_error = String::from("claim lost to a concurrent worker");

		for _ in 0..CLAIM_RETRY_LIMIT {
			let now = Utc::now();
			let stale_before = (now - self.staleness).timestamp_millis();

			let mut response = self
				.db
				.db
				.query(format!(
					"SELECT unit_key, sequence, status, owner FROM progress
                     WHERE job_id = $job_id AND {ELIGIBLE}
                     ORDER BY sequence ASC LIMIT 1"
				))
				.bind(("job_id", job_id.to_string()))
				.bind(("stale_before", stale_before))
				.await
				.map_err(db_err)?;
			let candidate: Option<serde_json::Value> = response.take(0).map_err(db_err)?;

			let Some(candidate) = candidate else {
				return Ok(None);
			};
			let unit_key = candidate["unit_key"].as_str().unwrap_or_default().to_string();
			let previous_owner = match candidate["status"].as_str() {
				Some("in_progress") => candidate["owner"].as_str().map(str::to_string),
				_ => None,
			};

			let claimed = self
				.db
				.db
				.query(format!(
					"UPDATE progress SET
                        status = 'in_progress',
                        attempts += 1,
                        retryable = false,
                        owner = $owner,
                        heartbeat_at = $now
                     WHERE job_id = $job_id AND unit_key = $unit_key AND {ELIGIBLE}
                     RETURN AFTER"
				))
				.bind(("job_id", job_id.to_string()))
				.bind(("unit_key", unit_key.clone()))
				.bind(("owner", owner.to_string()))
				.bind(("now", now.timestamp_millis()))
				.bind(("stale_before", stale_before))
				.await
				.and_then(|r| r.check());

			let rows: Vec<serde_json::Value> = match claimed {
				Ok(mut r) => r.take(0).map_err(db_err)?,
				Err(e) => {
					// Transaction conflicts surface here; re-read and try again.
					last_error = e.to_string();
					continue;
				}
			};

			let Some(record) = parse_rows(rows)?.into_iter().next() else {
				continue;
			};

			if let Some(prev) = &previous_owner {
				warn!(job_id, unit_key = %record.unit_key, previous_owner = %prev, "reclaimed stale claim");
			}

			return Ok(Some(ClaimedUnit {
				unit_key: record.unit_key,
				sequence: record.sequence,
				attempts: record.attempts,
				reclaimed_from: previous_owner,
			}));
		}

		Err(LedgerError::ClaimContention { job_id: job_id.to_string(), last_error })
	}

	/// Refresh a claim. Returns false when `owner` no longer holds it.
	pub async fn heartbeat(&self, job_id: &str, unit_key: &str, owner: &str) -> Result<bool, LedgerError> {
		let mut response = self
			.db
			.db
			.query(
				"UPDATE progress SET heartbeat_at = $now
                 WHERE job_id = $job_id AND unit_key = $unit_key
                   AND status = 'in_progress' AND owner = $owner
                 RETURN AFTER",
			)
			.bind(("job_id", job_id.to_string()))
			.bind(("unit_key", unit_key.to_string()))
			.bind(("owner", owner.to_string()))
			.bind(("now", Utc::now().timestamp_millis()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(!rows.is_empty())
	}

	/// Mark a unit done. Only lands while `owner` still holds the claim, so
	/// marking an already-done unit or a claim taken over by another owner is
	/// a no-op. Returns whether this call changed anything.
	pub async fn mark_done(
		&self,
		job_id: &str,
		unit_key: &str,
		owner: &str,
		output: Option<&serde_json::Value>,
	) -> Result<bool, LedgerError> {
		// A bound null would violate option<string>, so NONE goes in the text.
		let output_expr = if output.is_some() { "$output" } else { "NONE" };
		let mut response = self
			.db
			.db
			.query(format!(
				"UPDATE progress SET
                    status = 'done',
                    completed_at = $now,
                    output = {output_expr},
                    owner = NONE,
                    heartbeat_at = NONE,
                    retryable = false,
                    last_error = NONE
                 WHERE job_id = $job_id AND unit_key = $unit_key {HELD_BY_OWNER}
                 RETURN AFTER"
			))
			.bind(("job_id", job_id.to_string()))
			.bind(("unit_key", unit_key.to_string()))
			.bind(("owner", owner.to_string()))
			.bind(("now", Utc::now().timestamp_millis()))
			.bind(("output", output.map(|v| v.to_string()).unwrap_or_default()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(!rows.is_empty())
	}

	/// Mark a unit failed for good. Same ownership rule as [`Self::mark_done`].
	pub async fn mark_failed(&self, job_id: &str, unit_key: &str, owner: &str, error: &str) -> Result<bool, LedgerError> {
		self.set_failed(job_id, unit_key, owner, error, false).await
	}

	/// Mark a unit failed but hand it out again on the next claim.
	pub async fn mark_retry(&self, job_id: &str, unit_key: &str, owner: &str, error: &str) -> Result<bool, LedgerError> {
		self.set_failed(job_id, unit_key, owner, error, true).await
	}

	async fn set_failed(
		&self,
		job_id: &str,
		unit_key: &str,
		owner: &str,
		error: &str,
		retryable: bool,
	) -> Result<bool, LedgerError> {
		let mut response = self
			.db
			.db
			.query(format!(
				"UPDATE progress SET
                    status = 'failed',
                    retryable = $retryable,
                    last_error = $error,
                    owner = NONE,
                    heartbeat_at = NONE
                 WHERE job_id = $job_id AND unit_key = $unit_key {HELD_BY_OWNER}
                 RETURN AFTER"
			))
			.bind(("job_id", job_id.to_string()))
			.bind(("unit_key", unit_key.to_string()))
			.bind(("owner", owner.to_string()))
			.bind(("retryable", retryable))
			.bind(("error", error.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(!rows.is_empty())
	}

	pub async fn summary(&self, job_id: &str) -> Result<LedgerSummary, LedgerError> {
		let mut response = self
			.db
			.db
			.query(
				"SELECT
                    count() AS total,
                    math::sum(IF status = 'pending' THEN 1 ELSE 0 END) AS pending,
                    math::sum(IF status = 'in_progress' THEN 1 ELSE 0 END) AS in_progress,
                    math::sum(IF status = 'done' THEN 1 ELSE 0 END) AS done,
                    math::sum(IF status = 'failed' THEN 1 ELSE 0 END) AS failed,
                    math::sum(IF status = 'failed' AND retryable = true THEN 1 ELSE 0 END) AS retryable
                 FROM progress WHERE job_id = $job_id GROUP ALL",
			)
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(db_err)?;

		let row: Option<serde_json::Value> = response.take(0).map_err(db_err)?;

		Ok(match row {
			Some(r) => LedgerSummary {
				total: r["total"].as_u64().unwrap_or(0),
				pending: r["pending"].as_u64().unwrap_or(0),
				in_progress: r["in_progress"].as_u64().unwrap_or(0),
				done: r["done"].as_u64().unwrap_or(0),
				failed: r["failed"].as_u64().unwrap_or(0),
				retryable: r["retryable"].as_u64().unwrap_or(0),
			},
			None => LedgerSummary::default(),
		})
	}

	/// True iff the job has records and every one of them is done.
	/// Workers seed before claiming, so the record set covers the whole scope.
	pub async fn is_exhausted(&self, job_id: &str) -> Result<bool, LedgerError> {
		Ok(self.summary(job_id).await?.is_exhausted())
	}

	/// All records of a job in sequence order.
	pub async fn records(&self, job_id: &str) -> Result<Vec<ProgressRecord>, LedgerError> {
		let mut response = self
			.db
			.db
			.query("SELECT * OMIT id FROM progress WHERE job_id = $job_id ORDER BY sequence ASC")
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		parse_rows(rows)
	}

	pub async fn record(&self, job_id: &str, unit_key: &str) -> Result<Option<ProgressRecord>, LedgerError> {
		let mut response = self
			.db
			.db
			.query("SELECT * OMIT id FROM progress WHERE job_id = $job_id AND unit_key = $unit_key")
			.bind(("job_id", job_id.to_string()))
			.bind(("unit_key", unit_key.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(parse_rows(rows)?.into_iter().next())
	}

	/// Outputs of done units in sequence order, keyed by unit.
	pub async fn outputs(&self, job_id: &str) -> Result<Vec<(String, serde_json::Value)>, LedgerError> {
		Ok(self
			.records(job_id)
			.await?
			.into_iter()
			.filter(|r| r.status == UnitStatus::Done)
			.map(|r| (r.unit_key, r.output.unwrap_or(serde_json::Value::Null)))
			.collect())
	}

	/// Put failed and abandoned records back to pending with a fresh attempt
	/// budget. Only safe while no worker serves the job.
	pub async fn reset_unfinished(&self, job_id: &str) -> Result<u64, LedgerError> {
		let mut response = self
			.db
			.db
			.query(
				"UPDATE progress SET
                    status = 'pending',
                    attempts = 0,
                    retryable = false,
                    owner = NONE,
                    heartbeat_at = NONE
                 WHERE job_id = $job_id AND status IN ['failed', 'in_progress']
                 RETURN AFTER",
			)
			.bind(("job_id", job_id.to_string()))
			.await
			.map_err(db_err)?;
		let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
		Ok(rows.len() as u64)
	}
}

#[cfg(test)]
mod tests {
	use chrono::NaiveDate;

	use super::*;
	use crate::{db, models::Segment};

	fn scope(days: u32) -> Scope {
		let start = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
		let end = NaiveDate::from_ymd_opt(2025, 3, days).unwrap();
		Scope::new(start, end, [Segment::new("ACME", "Main")])
	}

	async fn ledger() -> ProgressLedger {
		let handle = db::open_memory().await.unwrap();
		ProgressLedger::new(handle, chrono::Duration::seconds(60))
	}

	async fn age_claim(ledger: &ProgressLedger, job_id: &str, unit_key: &str, by: chrono::Duration) {
		ledger
			.db
			.db
			.query("UPDATE progress SET heartbeat_at = $at WHERE job_id = $job_id AND unit_key = $unit_key")
			.bind(("at", (Utc::now() - by).timestamp_millis()))
			.bind(("job_id", job_id.to_string()))
			.bind(("unit_key", unit_key.to_string()))
			.await
			.unwrap()
			.check()
			.unwrap();
	}

	#[tokio::test]
	async fn seed_is_idempotent() {
		let ledger = ledger().await;
		assert_eq!(ledger.seed("job-a", &scope(3)).await.unwrap(), 3);
		assert_eq!(ledger.seed("job-a", &scope(3)).await.unwrap(), 0);

		let summary = ledger.summary("job-a").await.unwrap();
		assert_eq!(summary.total, 3);
		assert_eq!(summary.pending, 3);
	}

	#[tokio::test]
	async fn claims_in_sequence_order() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(3)).await.unwrap();

		let first = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		let second = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		assert_eq!(first.sequence, 0);
		assert_eq!(first.unit_key, "ACME/Main@2025-03-01");
		assert_eq!(first.attempts, 1);
		assert_eq!(second.sequence, 1);

		let record = ledger.record("job-a", &first.unit_key).await.unwrap().unwrap();
		assert_eq!(record.status, UnitStatus::InProgress);
		assert_eq!(record.owner.as_deref(), Some("w1"));
	}

	#[tokio::test]
	async fn fresh_claims_are_not_handed_out_twice() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(1)).await.unwrap();

		assert!(ledger.next_pending("job-a", "w1").await.unwrap().is_some());
		assert!(ledger.next_pending("job-a", "w2").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn concurrent_claims_never_share_a_unit() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(6)).await.unwrap();

		let mut handles = Vec::new();
		for w in 0..4 {
			let ledger = ledger.clone();
			handles.push(tokio::spawn(async move {
				let owner = format!("w{w}");
				let mut mine = Vec::new();
				while let Some(claim) = ledger.next_pending("job-a", &owner).await.unwrap() {
					mine.push(claim.unit_key);
				}
				mine
			}));
		}

		let mut all = Vec::new();
		for h in handles {
			all.extend(h.await.unwrap());
		}
		all.sort();
		let before = all.len();
		all.dedup();
		assert_eq!(before, 6);
		assert_eq!(all.len(), 6);
	}

	#[tokio::test]
	async fn stale_claim_is_reclaimed_once() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(2)).await.unwrap();

		let crashed = ledger.next_pending("job-a", "dead-worker").await.unwrap().unwrap();
		age_claim(&ledger, "job-a", &crashed.unit_key, chrono::Duration::seconds(120)).await;

		let reclaimed = ledger.next_pending("job-a", "w2").await.unwrap().unwrap();
		assert_eq!(reclaimed.unit_key, crashed.unit_key);
		assert_eq!(reclaimed.attempts, 2);
		assert_eq!(reclaimed.reclaimed_from.as_deref(), Some("dead-worker"));

		// Now fresh again: the next claim moves on.
		let next = ledger.next_pending("job-a", "w3").await.unwrap().unwrap();
		assert_eq!(next.sequence, 1);
	}

	#[tokio::test]
	async fn done_is_terminal_and_idempotent() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(1)).await.unwrap();
		let claim = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();

		let output = serde_json::json!({"debit": 10.0});
		assert!(ledger.mark_done("job-a", &claim.unit_key, "w1", Some(&output)).await.unwrap());
		assert!(!ledger.mark_done("job-a", &claim.unit_key, "w1", None).await.unwrap());
		assert!(!ledger.mark_failed("job-a", &claim.unit_key, "w1", "late failure").await.unwrap());
		assert!(!ledger.mark_retry("job-a", &claim.unit_key, "w1", "late retry").await.unwrap());
		assert_eq!(ledger.reset_unfinished("job-a").await.unwrap(), 0);

		let record = ledger.record("job-a", &claim.unit_key).await.unwrap().unwrap();
		assert_eq!(record.status, UnitStatus::Done);
		assert_eq!(record.output, Some(output.clone()));
		assert!(record.completed_at.is_some());
		assert!(record.owner.is_none());

		assert!(ledger.is_exhausted("job-a").await.unwrap());
		assert_eq!(ledger.outputs("job-a").await.unwrap(), vec![(claim.unit_key, output)]);
	}

	#[tokio::test]
	async fn retryable_failures_are_claimed_again_but_final_ones_are_not() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(2)).await.unwrap();

		let first = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		ledger.mark_retry("job-a", &first.unit_key, "w1", "timeout").await.unwrap();

		let again = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		assert_eq!(again.unit_key, first.unit_key);
		assert_eq!(again.attempts, 2);

		ledger.mark_failed("job-a", &again.unit_key, "w1", "ledger locked").await.unwrap();
		let next = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		assert_eq!(next.sequence, 1);

		let record = ledger.record("job-a", &first.unit_key).await.unwrap().unwrap();
		assert_eq!(record.status, UnitStatus::Failed);
		assert_eq!(record.last_error.as_deref(), Some("ledger locked"));
		assert!(!record.retryable);

		let summary = ledger.summary("job-a").await.unwrap();
		assert_eq!(summary.failed, 1);
		assert_eq!(summary.retryable, 0);
		assert_eq!(summary.in_progress, 1);
		assert!(!summary.is_exhausted());
	}

	#[tokio::test]
	async fn heartbeat_only_for_current_owner() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(1)).await.unwrap();
		let claim = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();

		assert!(ledger.heartbeat("job-a", &claim.unit_key, "w1").await.unwrap());
		assert!(!ledger.heartbeat("job-a", &claim.unit_key, "w2").await.unwrap());
	}

	#[tokio::test]
	async fn superseded_owner_cannot_settle_a_reclaimed_unit() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(1)).await.unwrap();

		let slow = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		age_claim(&ledger, "job-a", &slow.unit_key, chrono::Duration::seconds(120)).await;
		let taken = ledger.next_pending("job-a", "w2").await.unwrap().unwrap();
		assert_eq!(taken.unit_key, slow.unit_key);

		// w1 finishes late; none of its outcomes may release w2's claim.
		assert!(!ledger.mark_retry("job-a", &slow.unit_key, "w1", "timeout").await.unwrap());
		assert!(!ledger.mark_failed("job-a", &slow.unit_key, "w1", "boom").await.unwrap());
		assert!(!ledger.mark_done("job-a", &slow.unit_key, "w1", None).await.unwrap());
		assert!(ledger.next_pending("job-a", "w3").await.unwrap().is_none());

		let record = ledger.record("job-a", &slow.unit_key).await.unwrap().unwrap();
		assert_eq!(record.status, UnitStatus::InProgress);
		assert_eq!(record.owner.as_deref(), Some("w2"));

		assert!(ledger.mark_done("job-a", &slow.unit_key, "w2", None).await.unwrap());
		assert!(ledger.is_exhausted("job-a").await.unwrap());
	}

	#[tokio::test]
	async fn unclaimed_units_cannot_be_settled() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(1)).await.unwrap();
		let key = ledger.records("job-a").await.unwrap()[0].unit_key.clone();

		assert!(!ledger.mark_done("job-a", &key, "w1", None).await.unwrap());
		assert_eq!(ledger.summary("job-a").await.unwrap().pending, 1);
	}

	#[tokio::test]
	async fn concurrent_seeds_create_each_unit_once() {
		let ledger = ledger().await;
		let units = scope(3);

		let (a, b) = tokio::join!(ledger.seed("job-a", &units), ledger.seed("job-a", &units));
		assert_eq!(a.unwrap() + b.unwrap(), 3);
		assert_eq!(ledger.summary("job-a").await.unwrap().total, 3);
		assert_eq!(ledger.seed("job-a", &units).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn reset_unfinished_restores_attempt_budget() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(2)).await.unwrap();
		let a = ledger.next_pending("job-a", "w1").await.unwrap().unwrap();
		ledger.mark_failed("job-a", &a.unit_key, "w1", "boom").await.unwrap();
		ledger.next_pending("job-a", "w1").await.unwrap().unwrap();

		assert_eq!(ledger.reset_unfinished("job-a").await.unwrap(), 2);
		let summary = ledger.summary("job-a").await.unwrap();
		assert_eq!(summary.pending, 2);

		let again = ledger.next_pending("job-a", "w2").await.unwrap().unwrap();
		assert_eq!(again.unit_key, a.unit_key);
		assert_eq!(again.attempts, 1);
	}

	#[tokio::test]
	async fn jobs_do_not_see_each_others_records() {
		let ledger = ledger().await;
		ledger.seed("job-a", &scope(2)).await.unwrap();
		ledger.seed("job-b", &scope(3)).await.unwrap();

		assert_eq!(ledger.summary("job-a").await.unwrap().total, 2);
		assert_eq!(ledger.summary("job-b").await.unwrap().total, 3);
		assert_eq!(ledger.summary("job-c").await.unwrap(), LedgerSummary::default());
		assert!(!ledger.is_exhausted("job-c").await.unwrap());
	}
}
