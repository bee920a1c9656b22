use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	config::{EngineConfig, FailurePolicy, RetryPolicy},
	engine::{
		enumerator,
		job_store::{JobPatch, JobStore, JobStoreError},
		ledger::{ClaimedUnit, LedgerError, ProgressLedger},
		processor::{UnitError, UnitOutput, UnitProcessor},
		reporter::StatusReporter,
		state::{next_status, JobEvent},
	},
	models::{Job, JobStatus, WorkUnit},
};

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("job not found: {0}")]
	JobNotFound(String),

	#[error(transparent)]
	Ledger(#[from] LedgerError),

	#[error(transparent)]
	Store(#[from] JobStoreError),
}

/// What to do after one unit.
enum Step {
	Continue,
	Stop(JobStatus),
}

/// Runs the work loop of one Running job until it completes, fails, or
/// observes a pause/cancel request between units.
pub struct Worker {
	pub(crate) job_id: String,
	pub(crate) owner: String,
	pub(crate) store: JobStore,
	pub(crate) ledger: ProgressLedger,
	pub(crate) processor: Arc<dyn UnitProcessor>,
	pub(crate) reporter: StatusReporter,
	pub(crate) engine: EngineConfig,
	pub(crate) retry: RetryPolicy,
	/// Wakes idle and backoff waits early. The persisted flags decide what
	/// happens next.
	pub(crate) token: CancellationToken,
}

impl Worker {
	/// Returns the job status the loop left behind. An error out of the loop
	/// fails the job before it is returned, so no Running job is left without
	/// a worker.
	pub async fn run(self) -> Result<JobStatus, SchedulerError> {
		match self.run_loop().await {
			Err(e) if !matches!(e, SchedulerError::JobNotFound(_)) => {
				let patch = JobPatch::default().error(format!("worker error: {e}"));
				if let Err(record_err) = self.finish(JobEvent::Fail, patch).await {
					error!(job_id = %self.job_id, error = %record_err, "could not record worker failure");
				}
				Err(e)
			}
			result => result,
		}
	}

	async fn run_loop(&self) -> Result<JobStatus, SchedulerError> {
		let job = self.load().await?;
		if job.status != JobStatus::Running {
			return Ok(job.status);
		}

		// Fills in any unit the ledger has no record of yet.
		self.ledger.seed(&self.job_id, &job.scope).await?;
		info!(job_id = %self.job_id, owner = %self.owner, "worker started");

		loop {
			// Suspension point: the only place a worker stops.
			let job = self.load().await?;
			if job.status != JobStatus::Running {
				return Ok(job.status);
			}
			if job.cancel_requested {
				return self.finish(JobEvent::Cancel, JobPatch::default()).await;
			}
			if job.pause_requested {
				return self.finish(JobEvent::Halt, JobPatch::default()).await;
			}

			match self.ledger.next_pending(&self.job_id, &self.owner).await? {
				Some(claim) => {
					if let Step::Stop(status) = self.run_unit(&job, claim).await? {
						return Ok(status);
					}
				}
				None => {
					if let Step::Stop(status) = self.nothing_claimable(&job).await? {
						return Ok(status);
					}
				}
			}
		}
	}

	async fn load(&self) -> Result<Job, SchedulerError> {
		self.store
			.get(&self.job_id)
			.await?
			.ok_or_else(|| SchedulerError::JobNotFound(self.job_id.clone()))
	}

	async fn run_unit(&self, job: &Job, claim: ClaimedUnit) -> Result<Step, SchedulerError> {
		let unit = match enumerator::unit_at(&job.scope, claim.sequence) {
			Some(unit) if unit.key == claim.unit_key => unit,
			_ => {
				let reason = format!("unit {} is not part of the job scope", claim.unit_key);
				if !self.ledger.mark_failed(&self.job_id, &claim.unit_key, &self.owner, &reason).await? {
					return Ok(self.superseded(&claim.unit_key));
				}
				return self.after_final_failure(&claim.unit_key, reason).await;
			}
		};

		if let Some(previous) = &claim.reclaimed_from {
			info!(job_id = %self.job_id, unit_key = %unit.key, previous_owner = %previous, "resuming abandoned unit");
		}
		debug!(job_id = %self.job_id, unit_key = %unit.key, attempt = claim.attempts, "processing unit");

		match self.process_with_heartbeat(&unit).await {
			Ok(output) => {
				if !self.ledger.mark_done(&self.job_id, &unit.key, &self.owner, output.as_ref()).await? {
					return Ok(self.superseded(&unit.key));
				}
				let summary = self.ledger.summary(&self.job_id).await?;
				self.reporter.progress(&self.job_id, summary.done, summary.total);
				Ok(Step::Continue)
			}
			Err(err) if err.is_retryable() && self.retry.allows_another(claim.attempts) => {
				let delay = self.retry.backoff(claim.attempts);
				warn!(
					job_id = %self.job_id,
					unit_key = %unit.key,
					attempt = claim.attempts,
					error = %err,
					delay_ms = delay.as_millis() as u64,
					"unit failed, will retry"
				);
				if !self.ledger.mark_retry(&self.job_id, &unit.key, &self.owner, &err.to_string()).await? {
					return Ok(self.superseded(&unit.key));
				}
				self.sleep(delay).await;
				Ok(Step::Continue)
			}
			Err(err) => {
				error!(job_id = %self.job_id, unit_key = %unit.key, attempt = claim.attempts, error = %err, "unit failed");
				if !self.ledger.mark_failed(&self.job_id, &unit.key, &self.owner, &err.to_string()).await? {
					return Ok(self.superseded(&unit.key));
				}
				self.after_final_failure(&unit.key, err.to_string()).await
			}
		}
	}

	/// The claim went stale and another owner took the unit over; its result
	/// is theirs to record.
	fn superseded(&self, unit_key: &str) -> Step {
		warn!(job_id = %self.job_id, unit_key, owner = %self.owner, "claim superseded, dropping result");
		Step::Continue
	}

	async fn after_final_failure(&self, unit_key: &str, reason: String) -> Result<Step, SchedulerError> {
		match self.engine.failure_policy {
			FailurePolicy::FailFast => {
				let patch = JobPatch::default().error(format!("unit {unit_key} failed: {reason}"));
				Ok(Step::Stop(self.finish(JobEvent::Fail, patch).await?))
			}
			FailurePolicy::Continue => Ok(Step::Continue),
		}
	}

	/// Nothing claimable: either done, blocked on failed units, or waiting
	/// for a claim held elsewhere to finish or go stale.
	async fn nothing_claimable(&self, job: &Job) -> Result<Step, SchedulerError> {
		let summary = self.ledger.summary(&self.job_id).await?;

		if summary.is_exhausted() {
			return Ok(Step::Stop(self.complete(job).await?));
		}

		if summary.pending + summary.retryable + summary.in_progress > 0 {
			debug!(job_id = %self.job_id, in_progress = summary.in_progress, "waiting on claims held elsewhere");
			self.sleep(self.engine.idle_poll()).await;
			return Ok(Step::Continue);
		}

		let patch = JobPatch::default().error(format!("{} of {} units failed", summary.failed, summary.total));
		Ok(Step::Stop(self.finish(JobEvent::Fail, patch).await?))
	}

	async fn complete(&self, job: &Job) -> Result<JobStatus, SchedulerError> {
		let outputs = self.ledger.outputs(&self.job_id).await?;
		let mut attempt = 1;

		let total = loop {
			match self.processor.finalize(&self.job_id, &job.scope, &outputs).await {
				Ok(total) => break total,
				Err(err) if err.is_retryable() && self.retry.allows_another(attempt) => {
					warn!(job_id = %self.job_id, attempt, error = %err, "finalize failed, will retry");
					self.sleep(self.retry.backoff(attempt)).await;
					attempt += 1;
				}
				Err(err) => {
					error!(job_id = %self.job_id, error = %err, "finalize failed");
					let patch = JobPatch::default().error(format!("finalize failed: {err}"));
					return self.finish(JobEvent::Fail, patch).await;
				}
			}
		};

		let mut patch = JobPatch::default().clear_error();
		if let Some(total) = total {
			patch = patch.total(total);
		}
		self.finish(JobEvent::Complete, patch).await
	}

	/// Run the processor, refreshing the claim until it returns. Never
	/// interrupted: pause and cancel wait for the unit to finish.
	async fn process_with_heartbeat(&self, unit: &WorkUnit) -> Result<UnitOutput, UnitError> {
		let work = self.processor.process(&self.job_id, unit);
		tokio::pin!(work);

		let mut ticker = tokio::time::interval(self.engine.heartbeat_interval());
		// The first tick fires immediately; the claim is fresh already.
		ticker.tick().await;

		loop {
			tokio::select! {
				result = &mut work => return result,
				_ = ticker.tick() => match self.ledger.heartbeat(&self.job_id, &unit.key, &self.owner).await {
					Ok(true) => {}
					Ok(false) => warn!(job_id = %self.job_id, unit_key = %unit.key, "claim taken over while processing"),
					Err(e) => warn!(job_id = %self.job_id, unit_key = %unit.key, error = %e, "heartbeat failed"),
				},
			}
		}
	}

	async fn sleep(&self, delay: Duration) {
		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = self.token.cancelled() => {}
		}
	}

	/// Apply a worker-driven transition out of Running.
	async fn finish(&self, event: JobEvent, patch: JobPatch) -> Result<JobStatus, SchedulerError> {
		let Some(to) = next_status(JobStatus::Running, event) else {
			return Ok(self.load().await?.status);
		};

		match self.store.transition(&self.job_id, JobStatus::Running, to, patch).await? {
			Some(_) => {
				info!(job_id = %self.job_id, event = event.as_str(), status = %to, "worker stopped");
				self.reporter.status_changed(&self.job_id, JobStatus::Running, to);
				Ok(to)
			}
			// Someone else moved the job first; report what they left.
			None => Ok(self.load().await?.status),
		}
	}
}
