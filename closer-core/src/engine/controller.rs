//! The single entry point for job lifecycle commands.
//!
//! Every command is applied as a compare-and-set on the persisted status, so a
//! rejected or lost race leaves the job untouched and reports what it found.
//! Running jobs are served by one worker task each; pause and cancel only set
//! a flag the worker honors between units.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::{
	config::{Config, EngineConfig, RetryPolicy},
	db::DbHandle,
	engine::{
		enumerator,
		job_store::{JobPatch, JobStore, JobStoreError},
		ledger::{LedgerError, ProgressLedger},
		processor::UnitProcessor,
		reporter::StatusReporter,
		scheduler::Worker,
		state::{next_status, JobEvent},
	},
	models::{Job, JobStatus, LedgerSummary, ProgressRecord, Scope, ScopeError},
};

#[derive(Debug, Error)]
pub enum ControlError {
	#[error("job not found: {0}")]
	JobNotFound(String),

	#[error("invalid scope: {0}")]
	InvalidScope(#[from] ScopeError),

	#[error(transparent)]
	Store(#[from] JobStoreError),

	#[error(transparent)]
	Ledger(#[from] LedgerError),
}

/// Result of a lifecycle command. A rejected command is not an error: it
/// changed nothing, and `status` is what the job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
	pub accepted: bool,
	pub status: JobStatus,
}

impl TransitionOutcome {
	fn accepted(status: JobStatus) -> Self {
		Self { accepted: true, status }
	}

	fn rejected(status: JobStatus) -> Self {
		Self { accepted: false, status }
	}
}

struct WorkerHandle {
	owner: String,
	token: CancellationToken,
	finished: watch::Receiver<bool>,
}

struct Inner {
	store: JobStore,
	ledger: ProgressLedger,
	processor: Arc<dyn UnitProcessor>,
	reporter: StatusReporter,
	engine: EngineConfig,
	retry: RetryPolicy,
	/// Serializes commands so overlap checks and scope edits see a stable view.
	commands: tokio::sync::Mutex<()>,
	workers: Mutex<HashMap<String, WorkerHandle>>,
}

#[derive(Clone)]
pub struct JobController {
	inner: Arc<Inner>,
}

impl JobController {
	pub fn new(db: DbHandle, processor: Arc<dyn UnitProcessor>, config: &Config, reporter: StatusReporter) -> Self {
		Self {
			inner: Arc::new(Inner {
				store: JobStore::new(db.clone()),
				ledger: ProgressLedger::new(db, config.engine.staleness_threshold()),
				processor,
				reporter,
				engine: config.engine.clone(),
				retry: config.retry.clone(),
				commands: tokio::sync::Mutex::new(()),
				workers: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// Create a Draft job for `scope`.
	pub async fn create(&self, scope: Scope) -> Result<Job, ControlError> {
		scope.validate()?;
		let now = Utc::now();
		let job = Job {
			id: Ulid::new().to_string(),
			total_units: enumerator::unit_count(&scope),
			scope,
			status: JobStatus::Draft,
			created_at: now,
			started_at: None,
			last_transition_at: now,
			pause_requested: false,
			cancel_requested: false,
			total: None,
			last_error: None,
		};
		self.inner.store.insert(&job).await?;
		info!(job_id = %job.id, units = job.total_units, "job created");
		Ok(job)
	}

	/// Replace the scope of a Draft job.
	pub async fn update_scope(&self, job_id: &str, scope: Scope) -> Result<TransitionOutcome, ControlError> {
		scope.validate()?;
		let _guard = self.inner.commands.lock().await;

		let units = enumerator::unit_count(&scope);
		match self.inner.store.update_scope(job_id, &scope, units).await? {
			Some(job) => Ok(TransitionOutcome::accepted(job.status)),
			None => Ok(TransitionOutcome::rejected(self.load(job_id).await?.status)),
		}
	}

	/// Draft -> Queued. Writes a pending ledger record for every unit first.
	pub async fn submit(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;
		if job.status != JobStatus::Draft {
			return Ok(TransitionOutcome::rejected(job.status));
		}

		let seeded = self.inner.ledger.seed(job_id, &job.scope).await?;
		info!(job_id, seeded, "ledger seeded");
		self.apply(&job, JobEvent::Submit, JobPatch::default()).await
	}

	/// Queued -> Running and spawn its worker. Rejected while another Running
	/// job covers an overlapping scope.
	pub async fn start(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;
		if job.status != JobStatus::Queued || self.overlaps_running(&job).await? {
			return Ok(TransitionOutcome::rejected(job.status));
		}

		let patch = JobPatch::default().started_at(Utc::now()).pause_requested(false).cancel_requested(false);
		let outcome = self.apply(&job, JobEvent::Start, patch).await?;
		if outcome.accepted {
			self.spawn_worker(job_id);
		}
		Ok(outcome)
	}

	/// Ask a Running job to stop after its current unit. The job stays
	/// Running until the worker observes the request.
	pub async fn pause(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;
		if job.status != JobStatus::Running {
			return Ok(TransitionOutcome::rejected(job.status));
		}

		match self.inner.store.request_pause(job_id, JobStatus::Running).await? {
			Some(job) => {
				info!(job_id, "pause requested");
				self.wake_worker(job_id);
				Ok(TransitionOutcome::accepted(job.status))
			}
			None => Ok(TransitionOutcome::rejected(self.load(job_id).await?.status)),
		}
	}

	/// Paused -> Running, continuing from the ledger.
	pub async fn resume(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;
		if job.status != JobStatus::Paused || self.overlaps_running(&job).await? {
			return Ok(TransitionOutcome::rejected(job.status));
		}

		let outcome = self.apply(&job, JobEvent::Resume, JobPatch::default().pause_requested(false)).await?;
		if outcome.accepted {
			self.spawn_worker(job_id);
		}
		Ok(outcome)
	}

	/// Queued and Paused jobs are cancelled at once. A Running job is
	/// cancelled by its worker after the current unit.
	pub async fn cancel(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;

		match job.status {
			JobStatus::Queued | JobStatus::Paused => {
				self.apply(&job, JobEvent::Cancel, JobPatch::default().cancel_requested(true)).await
			}
			JobStatus::Running => match self.inner.store.request_cancel(job_id, JobStatus::Running).await? {
				Some(job) => {
					info!(job_id, "cancel requested");
					self.wake_worker(job_id);
					Ok(TransitionOutcome::accepted(job.status))
				}
				None => Ok(TransitionOutcome::rejected(self.load(job_id).await?.status)),
			},
			other => Ok(TransitionOutcome::rejected(other)),
		}
	}

	/// Failed -> Queued. Failed and abandoned units go back to pending with
	/// a fresh attempt budget; done units stay done.
	pub async fn requeue(&self, job_id: &str) -> Result<TransitionOutcome, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let job = self.load(job_id).await?;
		if job.status != JobStatus::Failed {
			return Ok(TransitionOutcome::rejected(job.status));
		}

		let reset = self.inner.ledger.reset_unfinished(job_id).await?;
		info!(job_id, reset, "unfinished units reset");
		self.apply(&job, JobEvent::Requeue, JobPatch::default().clear_error()).await
	}

	pub async fn status(&self, job_id: &str) -> Result<Job, ControlError> {
		self.load(job_id).await
	}

	pub async fn progress(&self, job_id: &str) -> Result<LedgerSummary, ControlError> {
		self.load(job_id).await?;
		Ok(self.inner.ledger.summary(job_id).await?)
	}

	pub async fn units(&self, job_id: &str) -> Result<Vec<ProgressRecord>, ControlError> {
		self.load(job_id).await?;
		Ok(self.inner.ledger.records(job_id).await?)
	}

	pub async fn list(&self) -> Result<Vec<Job>, ControlError> {
		Ok(self.inner.store.list().await?)
	}

	/// Wait until this process has no live worker for `job_id`, then return
	/// the job as persisted.
	pub async fn wait(&self, job_id: &str) -> Result<Job, ControlError> {
		let finished = self.inner.workers.lock().get(job_id).map(|w| w.finished.clone());
		if let Some(mut finished) = finished {
			while !*finished.borrow() {
				if finished.changed().await.is_err() {
					break;
				}
			}
		}
		self.load(job_id).await
	}

	/// Whether this process runs a worker for `job_id`.
	pub fn is_active(&self, job_id: &str) -> bool {
		self.inner.workers.lock().contains_key(job_id)
	}

	/// Spawn workers for persisted Running jobs nobody in this process
	/// serves, e.g. after a crash. Abandoned unit claims are picked up once
	/// they go stale. Returns the recovered job ids.
	pub async fn recover(&self) -> Result<Vec<String>, ControlError> {
		let _guard = self.inner.commands.lock().await;
		let mut recovered = Vec::new();

		for job in self.inner.store.list_by_status(JobStatus::Running).await? {
			if self.is_active(&job.id) {
				continue;
			}
			info!(job_id = %job.id, "recovering running job");
			self.spawn_worker(&job.id);
			recovered.push(job.id);
		}
		Ok(recovered)
	}

	async fn load(&self, job_id: &str) -> Result<Job, ControlError> {
		self.inner
			.store
			.get(job_id)
			.await?
			.ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))
	}

	/// Apply `event` to `job` as seen just now. A lost race is reported as a
	/// rejection with the status the winner left.
	async fn apply(&self, job: &Job, event: JobEvent, patch: JobPatch) -> Result<TransitionOutcome, ControlError> {
		let Some(to) = next_status(job.status, event) else {
			return Ok(TransitionOutcome::rejected(job.status));
		};

		match self.inner.store.transition(&job.id, job.status, to, patch).await? {
			Some(_) => {
				info!(job_id = %job.id, event = event.as_str(), from = %job.status, to = %to, "job transitioned");
				self.inner.reporter.status_changed(&job.id, job.status, to);
				Ok(TransitionOutcome::accepted(to))
			}
			None => Ok(TransitionOutcome::rejected(self.load(&job.id).await?.status)),
		}
	}

	async fn overlaps_running(&self, job: &Job) -> Result<bool, ControlError> {
		let running = self.inner.store.list_by_status(JobStatus::Running).await?;
		match running.iter().find(|other| other.id != job.id && other.scope.overlaps(&job.scope)) {
			Some(other) => {
				warn!(job_id = %job.id, running = %other.id, "scope overlaps a running job");
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// Wake the job's worker out of any wait so it reads the new flags. With
	/// no worker in this process, spawn one to act on them.
	fn wake_worker(&self, job_id: &str) {
		let token = self.inner.workers.lock().get(job_id).map(|w| w.token.clone());
		match token {
			Some(token) => token.cancel(),
			None => self.spawn_worker(job_id),
		}
	}

	fn spawn_worker(&self, job_id: &str) {
		let owner = format!("worker-{}", Ulid::new());
		let token = CancellationToken::new();
		let (done_tx, done_rx) = watch::channel(false);

		self.inner.workers.lock().insert(
			job_id.to_string(),
			WorkerHandle { owner: owner.clone(), token: token.clone(), finished: done_rx },
		);

		let worker = Worker {
			job_id: job_id.to_string(),
			owner: owner.clone(),
			store: self.inner.store.clone(),
			ledger: self.inner.ledger.clone(),
			processor: Arc::clone(&self.inner.processor),
			reporter: self.inner.reporter.clone(),
			engine: self.inner.engine.clone(),
			retry: self.inner.retry.clone(),
			token,
		};

		let inner = Arc::clone(&self.inner);
		let job_id = job_id.to_string();
		let span = info_span!("worker", job_id = %job_id, owner = %owner);

		tokio::spawn(
			async move {
				match worker.run().await {
					Ok(status) => info!(%status, "worker exited"),
					Err(e) => error!(error = %e, "worker stopped on error"),
				}

				let mut workers = inner.workers.lock();
				// A newer worker may have replaced this one already.
				if workers.get(&job_id).is_some_and(|w| w.owner == owner) {
					workers.remove(&job_id);
				}
				drop(workers);
				let _ = done_tx.send(true);
			}
			.instrument(span),
		);
	}
}
