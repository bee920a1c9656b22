use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::JobStatus;

/// Receives job status changes. Delivery is best-effort: the state machine
/// never depends on an observer.
pub trait StatusObserver: Send + Sync {
	fn on_status_changed(&self, job_id: &str, old: JobStatus, new: JobStatus);

	/// Called after each unit finishes.
	fn on_progress(&self, _job_id: &str, _done: u64, _total: u64) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
	StatusChanged { job_id: String, old: JobStatus, new: JobStatus },
	Progress { job_id: String, done: u64, total: u64 },
}

/// Fans events out to every registered observer.
#[derive(Clone, Default)]
pub struct StatusReporter {
	observers: Vec<Arc<dyn StatusObserver>>,
}

impl StatusReporter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
		self.observers.push(observer);
		self
	}

	pub fn status_changed(&self, job_id: &str, old: JobStatus, new: JobStatus) {
		for observer in &self.observers {
			let delivered = catch_unwind(AssertUnwindSafe(|| observer.on_status_changed(job_id, old, new)));
			if delivered.is_err() {
				warn!(job_id, %old, %new, "status observer panicked");
			}
		}
	}

	pub fn progress(&self, job_id: &str, done: u64, total: u64) {
		for observer in &self.observers {
			let delivered = catch_unwind(AssertUnwindSafe(|| observer.on_progress(job_id, done, total)));
			if delivered.is_err() {
				warn!(job_id, done, total, "progress observer panicked");
			}
		}
	}
}

/// Logs every event.
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
	fn on_status_changed(&self, job_id: &str, old: JobStatus, new: JobStatus) {
		info!(job_id, %old, %new, "job status changed");
	}

	fn on_progress(&self, job_id: &str, done: u64, total: u64) {
		info!(job_id, done, total, "job progress");
	}
}

/// Forwards events into a channel, e.g. for a UI refresh loop.
pub struct ChannelObserver {
	tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}
}

impl StatusObserver for ChannelObserver {
	fn on_status_changed(&self, job_id: &str, old: JobStatus, new: JobStatus) {
		// Receiver gone means nobody is listening any more.
		let _ = self.tx.send(StatusEvent::StatusChanged { job_id: job_id.to_string(), old, new });
	}

	fn on_progress(&self, job_id: &str, done: u64, total: u64) {
		let _ = self.tx.send(StatusEvent::Progress { job_id: job_id.to_string(), done, total });
	}
}
