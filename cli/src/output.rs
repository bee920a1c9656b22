use closer_core::{
	engine::TransitionOutcome,
	models::{Job, JobStatus, LedgerSummary, ProgressRecord, UnitStatus},
};
use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::json;

fn print_json(value: serde_json::Value) {
	match serde_json::to_string_pretty(&value) {
		Ok(text) => println!("{text}"),
		Err(e) => eprintln!("failed to encode output: {e}"),
	}
}

fn status_label(status: JobStatus) -> StyledObject<String> {
	let label = style(status.to_string());
	match status {
		JobStatus::Completed => label.green(),
		JobStatus::Running | JobStatus::Queued => label.cyan(),
		JobStatus::Paused => label.yellow(),
		JobStatus::Failed => label.red(),
		JobStatus::Draft | JobStatus::Cancelled => label.dim(),
	}
}

pub fn job(job: &Job, summary: Option<&LedgerSummary>, json: bool) {
	if json {
		print_json(json!({ "job": job, "progress": summary }));
		return;
	}

	println!("{} {}", style(&job.id).bold(), status_label(job.status));
	let segments: Vec<String> = job.scope.segments.iter().map(|s| format!("{}/{}", s.company, s.cost_center)).collect();
	println!("  period:   {} .. {}", job.scope.period_start, job.scope.period_end);
	println!("  segments: {}", segments.join(", "));
	println!("  units:    {}", job.total_units);
	if let Some(summary) = summary {
		println!(
			"  progress: {} done, {} pending, {} in progress, {} failed",
			summary.done, summary.pending, summary.in_progress, summary.failed
		);
	}
	if let Some(total) = &job.total {
		println!("  total:    {total}");
	}
	if let Some(err) = &job.last_error {
		println!("  error:    {}", style(err).red());
	}
}

pub fn jobs(jobs: &[Job], json: bool) {
	if json {
		print_json(json!(jobs));
		return;
	}
	if jobs.is_empty() {
		println!("no jobs");
		return;
	}
	for job in jobs {
		println!(
			"{}  {:<10} {} .. {}  {} units",
			job.id,
			status_label(job.status),
			job.scope.period_start,
			job.scope.period_end,
			job.total_units
		);
	}
}

pub fn units(records: &[ProgressRecord], json: bool) {
	if json {
		print_json(json!(records));
		return;
	}
	for record in records {
		let status = style(record.status.as_str());
		let status = match record.status {
			UnitStatus::Done => status.green(),
			UnitStatus::Failed => status.red(),
			UnitStatus::InProgress => status.cyan(),
			UnitStatus::Pending => status.dim(),
		};
		print!("  {:>5}  {:<11} {}", record.sequence, status, record.unit_key);
		match &record.last_error {
			Some(err) if record.status != UnitStatus::Done => println!("  ({} attempts: {err})", record.attempts),
			_ => println!(),
		}
	}
}

pub fn outcome(command: &str, job_id: &str, outcome: TransitionOutcome, json: bool) {
	if json {
		print_json(json!({ "job_id": job_id, "command": command, "accepted": outcome.accepted, "status": outcome.status }));
		return;
	}
	if outcome.accepted {
		println!("{job_id}: {command} ok, now {}", status_label(outcome.status));
	} else {
		eprintln!("{job_id}: {command} not applied, job is {}", status_label(outcome.status));
	}
}

pub fn note(message: &str, json: bool) {
	if json {
		print_json(json!({ "message": message }));
	} else {
		println!("{message}");
	}
}

/// Hidden in JSON mode so stdout stays parseable.
pub fn progress_bar(total: u64, done: u64, json: bool) -> ProgressBar {
	let bar = ProgressBar::new(total);
	if json {
		bar.set_draw_target(ProgressDrawTarget::hidden());
		return bar;
	}
	if let Ok(template) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} units") {
		bar.set_style(template);
	}
	bar.set_position(done);
	bar
}
