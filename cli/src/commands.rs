use std::{process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use closer_core::{
	config::Config,
	db,
	engine::{
		ChannelObserver, CommandProcessor, DryRunProcessor, JobController, StatusEvent, StatusReporter,
		TracingObserver, TransitionOutcome, UnitProcessor,
	},
	models::JobStatus,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::{output, Cli, Command};

/// Exit status when the job's current status does not allow the command.
const EXIT_REJECTED: u8 = 2;

pub async fn run(cli: Cli) -> Result<ExitCode> {
	let mut config = Config::load_or_default(cli.config.as_deref()).context("loading config")?;
	if let Some(path) = cli.db {
		config.db_path = Some(path);
	}

	let runs_units = matches!(cli.command, Command::Start { .. } | Command::Resume { .. } | Command::Recover);
	let processor = processor(&config, cli.dry_run, runs_units)?;

	let db_path = config.db_path();
	let handle = db::open(&db_path).await.with_context(|| format!("opening database {}", db_path.display()))?;

	let (observer, mut events) = ChannelObserver::new();
	let reporter = StatusReporter::new().with_observer(Arc::new(TracingObserver)).with_observer(Arc::new(observer));
	let controller = JobController::new(handle, processor, &config, reporter);
	let json = cli.json;

	match cli.command {
		Command::Create(args) => {
			let job = controller.create(args.into_scope()).await?;
			output::job(&job, None, json);
			Ok(ExitCode::SUCCESS)
		}
		Command::Edit { id, scope } => {
			let outcome = controller.update_scope(&id, scope.into_scope()).await?;
			Ok(report("edit", &id, outcome, json))
		}
		Command::Submit { id } => {
			let outcome = controller.submit(&id).await?;
			Ok(report("submit", &id, outcome, json))
		}
		Command::Start { id } => {
			let outcome = controller.start(&id).await?;
			if !outcome.accepted {
				return Ok(report("start", &id, outcome, json));
			}
			let status = follow(&controller, &id, std::slice::from_ref(&id), &mut 0, &mut events, json).await?;
			Ok(exit_for(status))
		}
		Command::Resume { id } => {
			let outcome = controller.resume(&id).await?;
			if !outcome.accepted {
				return Ok(report("resume", &id, outcome, json));
			}
			let status = follow(&controller, &id, std::slice::from_ref(&id), &mut 0, &mut events, json).await?;
			Ok(exit_for(status))
		}
		Command::Pause { id } => {
			let outcome = controller.pause(&id).await?;
			settle("pause", &controller, &id, outcome, json).await
		}
		Command::Cancel { id } => {
			let outcome = controller.cancel(&id).await?;
			settle("cancel", &controller, &id, outcome, json).await
		}
		Command::Requeue { id } => {
			let outcome = controller.requeue(&id).await?;
			Ok(report("requeue", &id, outcome, json))
		}
		Command::Status { id, units } => {
			let job = controller.status(&id).await?;
			let summary = controller.progress(&id).await?;
			output::job(&job, Some(&summary), json);
			if units {
				output::units(&controller.units(&id).await?, json);
			}
			Ok(ExitCode::SUCCESS)
		}
		Command::List => {
			output::jobs(&controller.list().await?, json);
			Ok(ExitCode::SUCCESS)
		}
		Command::Recover => recover(&controller, &mut events, json).await,
	}
}

fn processor(config: &Config, dry_run: bool, runs_units: bool) -> Result<Arc<dyn UnitProcessor>> {
	if dry_run {
		return Ok(Arc::new(DryRunProcessor));
	}
	match CommandProcessor::from_config(&config.processor) {
		Some(p) => Ok(Arc::new(p)),
		None if runs_units => bail!("no processor command configured; set [processor] command or pass --dry-run"),
		// Workers spawned by pause/cancel stop before touching a unit.
		None => Ok(Arc::new(DryRunProcessor)),
	}
}

fn report(command: &str, job_id: &str, outcome: TransitionOutcome, json: bool) -> ExitCode {
	output::outcome(command, job_id, outcome, json);
	if outcome.accepted {
		ExitCode::SUCCESS
	} else {
		ExitCode::from(EXIT_REJECTED)
	}
}

/// Pause or cancel a Running job nobody is serving: this process runs the
/// worker that applies the request, so wait for it.
async fn settle(
	command: &str,
	controller: &JobController,
	job_id: &str,
	outcome: TransitionOutcome,
	json: bool,
) -> Result<ExitCode> {
	if !outcome.accepted || outcome.status != JobStatus::Running {
		return Ok(report(command, job_id, outcome, json));
	}
	let job = controller.wait(job_id).await?;
	let settled = TransitionOutcome { accepted: true, status: job.status };
	Ok(report(command, job_id, settled, json))
}

async fn recover(controller: &JobController, events: &mut UnboundedReceiver<StatusEvent>, json: bool) -> Result<ExitCode> {
	let recovered = controller.recover().await?;
	if recovered.is_empty() {
		output::note("no running jobs to recover", json);
		return Ok(ExitCode::SUCCESS);
	}

	// Every recovered worker runs concurrently; follow them one at a time
	// while Ctrl-C reaches all of them.
	let mut failed = false;
	let mut interrupts = 0;
	for job_id in &recovered {
		info!(job_id = %job_id, "following recovered job");
		failed |= follow(controller, job_id, &recovered, &mut interrupts, events, json).await? == JobStatus::Failed;
	}
	Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn exit_for(status: JobStatus) -> ExitCode {
	match status {
		JobStatus::Failed => ExitCode::FAILURE,
		_ => ExitCode::SUCCESS,
	}
}

/// Apply the `count`-th Ctrl-C to every job in `targets`.
async fn interrupt(controller: &JobController, targets: &[String], count: u32) -> Result<&'static str> {
	if count == 1 {
		for target in targets {
			controller.pause(target).await?;
		}
		Ok("pausing after the current unit (Ctrl-C again to cancel)")
	} else {
		for target in targets {
			controller.cancel(target).await?;
		}
		Ok("cancelling after the current unit")
	}
}

/// Show progress until the job's worker exits. The first Ctrl-C pauses every
/// job in `targets` after its current unit, the second cancels them.
/// `interrupts` carries the count across follows.
async fn follow(
	controller: &JobController,
	job_id: &str,
	targets: &[String],
	interrupts: &mut u32,
	events: &mut UnboundedReceiver<StatusEvent>,
	json: bool,
) -> Result<JobStatus> {
	let summary = controller.progress(job_id).await?;
	let bar = output::progress_bar(summary.total, summary.done, json);

	let finished = controller.wait(job_id);
	tokio::pin!(finished);

	let job = loop {
		tokio::select! {
			job = &mut finished => break job?,
			Some(event) = events.recv() => {
				if let StatusEvent::Progress { job_id: id, done, .. } = event {
					if id == job_id {
						bar.set_position(done);
					}
				}
			}
			signal = tokio::signal::ctrl_c() => {
				signal.context("listening for Ctrl-C")?;
				*interrupts += 1;
				bar.println(interrupt(controller, targets, *interrupts).await?);
			}
		}
	};

	bar.finish_and_clear();
	let summary = controller.progress(job_id).await?;
	output::job(&job, Some(&summary), json);
	Ok(job.status)
}

#[cfg(test)]
mod tests {
	use chrono::NaiveDate;
	use closer_core::{
		engine::job_store::{JobPatch, JobStore},
		models::{Scope, Segment},
	};

	use super::*;

	async fn running_jobs(count: usize) -> (JobController, Vec<String>) {
		let handle = db::open_memory().await.unwrap();
		let controller = JobController::new(handle.clone(), Arc::new(DryRunProcessor), &Config::default(), StatusReporter::new());
		let store = JobStore::new(handle);
		let day = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();

		let mut ids = Vec::new();
		for i in 0..count {
			let job = controller.create(Scope::new(day, day, [Segment::new("ACME", format!("CC{i}"))])).await.unwrap();
			controller.submit(&job.id).await.unwrap();
			// Running with no worker, as `recover` finds them after a crash.
			store.transition(&job.id, JobStatus::Queued, JobStatus::Running, JobPatch::default()).await.unwrap();
			ids.push(job.id);
		}
		(controller, ids)
	}

	#[tokio::test]
	async fn first_interrupt_pauses_every_target() {
		let (controller, ids) = running_jobs(2).await;

		interrupt(&controller, &ids, 1).await.unwrap();
		for id in &ids {
			assert_eq!(controller.wait(id).await.unwrap().status, JobStatus::Paused);
		}
	}

	#[tokio::test]
	async fn second_interrupt_cancels_every_target() {
		let (controller, ids) = running_jobs(3).await;

		interrupt(&controller, &ids, 2).await.unwrap();
		for id in &ids {
			assert_eq!(controller.wait(id).await.unwrap().status, JobStatus::Cancelled);
		}
	}
}
