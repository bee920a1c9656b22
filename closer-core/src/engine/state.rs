use crate::models::JobStatus;

/// Everything that can move a job between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
	Submit,
	Start,
	/// A worker observed `pause_requested` between units.
	Halt,
	Resume,
	/// Ledger exhausted with no failed units.
	Complete,
	Fail,
	Cancel,
	/// Put a failed job back in the queue.
	Requeue,
}

impl JobEvent {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobEvent::Submit => "submit",
			JobEvent::Start => "start",
			JobEvent::Halt => "halt",
			JobEvent::Resume => "resume",
			JobEvent::Complete => "complete",
			JobEvent::Fail => "fail",
			JobEvent::Cancel => "cancel",
			JobEvent::Requeue => "requeue",
		}
	}
}

/// The transition table. `None` means the event is not allowed from `from`.
pub fn next_status(from: JobStatus, event: JobEvent) -> Option<JobStatus> {
	use JobEvent as E;
	use JobStatus as S;

	match (from, event) {
		(S::Draft, E::Submit) => Some(S::Queued),
		(S::Queued, E::Start) => Some(S::Running),
		(S::Running, E::Halt) => Some(S::Paused),
		(S::Paused, E::Resume) => Some(S::Running),
		(S::Running, E::Complete) => Some(S::Completed),
		(S::Running, E::Fail) => Some(S::Failed),
		(S::Queued | S::Running | S::Paused, E::Cancel) => Some(S::Cancelled),
		(S::Failed, E::Requeue) => Some(S::Queued),
		_ => None,
	}
}
