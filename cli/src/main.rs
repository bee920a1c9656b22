mod commands;
mod output;

use std::{path::PathBuf, process::ExitCode};

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use closer_core::models::{Granularity, Scope, Segment};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "closer", version, about = "Resumable period-closing jobs")]
struct Cli {
	/// Config file (defaults to the platform config dir).
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Database path, overriding the config.
	#[arg(long, global = true)]
	db: Option<PathBuf>,

	/// Process units without running the configured command.
	#[arg(long, global = true)]
	dry_run: bool,

	/// Print machine-readable JSON.
	#[arg(long, global = true)]
	json: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Create a draft job.
	Create(ScopeArgs),
	/// Replace the scope of a draft job.
	Edit {
		id: String,
		#[command(flatten)]
		scope: ScopeArgs,
	},
	/// Queue a draft job.
	Submit { id: String },
	/// Start a queued job and follow it. Ctrl-C pauses; a second Ctrl-C cancels.
	Start { id: String },
	/// Ask a running job to pause after its current unit.
	Pause { id: String },
	/// Resume a paused job and follow it.
	Resume { id: String },
	/// Cancel a queued, running, or paused job.
	Cancel { id: String },
	/// Put a failed job back in the queue.
	Requeue { id: String },
	/// Show a job and its progress.
	Status {
		id: String,
		/// Also list every unit.
		#[arg(long)]
		units: bool,
	},
	/// List all jobs.
	List,
	/// Pick up running jobs left behind by a crashed process and follow them.
	/// Ctrl-C pauses every recovered job; a second Ctrl-C cancels them all.
	Recover,
}

#[derive(Args)]
struct ScopeArgs {
	/// First day of the period (YYYY-MM-DD).
	#[arg(long)]
	from: NaiveDate,

	/// Last day of the period, inclusive.
	#[arg(long)]
	to: NaiveDate,

	/// COMPANY/COST_CENTER, repeatable.
	#[arg(long = "segment", required = true, value_parser = parse_segment)]
	segments: Vec<Segment>,

	/// `daily` (one unit per date) or `period` (one unit per segment).
	#[arg(long, default_value = "daily", value_parser = parse_granularity)]
	granularity: Granularity,
}

impl ScopeArgs {
	fn into_scope(self) -> Scope {
		Scope::new(self.from, self.to, self.segments).with_granularity(self.granularity)
	}
}

fn parse_segment(s: &str) -> Result<Segment, String> {
	match s.split_once('/') {
		Some((company, cost_center)) if !company.trim().is_empty() && !cost_center.trim().is_empty() => {
			Ok(Segment::new(company.trim(), cost_center.trim()))
		}
		_ => Err(format!("expected COMPANY/COST_CENTER, got {s:?}")),
	}
}

fn parse_granularity(s: &str) -> Result<Granularity, String> {
	match s {
		"daily" => Ok(Granularity::Daily),
		"period" => Ok(Granularity::Period),
		other => Err(format!("unknown granularity {other:?} (expected daily or period)")),
	}
}

/// Logs go to `closer.log` in the data dir; stderr only shows warnings
/// unless RUST_LOG says otherwise.
fn init_logging() {
	let log_dir = closer_core::config::data_dir();
	std::fs::create_dir_all(&log_dir).ok();
	let file_appender = tracing_appender::rolling::never(log_dir, "closer.log");

	let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.with_writer(file_appender)
				.with_ansi(false)
				.with_filter(file_filter),
		)
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(stderr_filter))
		.init();
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_logging();

	match commands::run(cli).await {
		Ok(code) => code,
		Err(e) => {
			eprintln!("{} {e:#}", console::style("error:").red().bold());
			ExitCode::FAILURE
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn segment_requires_both_parts() {
		assert_eq!(parse_segment("ACME/Main").unwrap(), Segment::new("ACME", "Main"));
		assert_eq!(parse_segment(" ACME / Main ").unwrap(), Segment::new("ACME", "Main"));
		assert!(parse_segment("ACME").is_err());
		assert!(parse_segment("ACME/").is_err());
	}

	#[test]
	fn create_parses_scope() {
		let cli = Cli::try_parse_from([
			"closer",
			"create",
			"--from",
			"2025-01-01",
			"--to",
			"2025-01-31",
			"--segment",
			"ACME/Main",
			"--segment",
			"ACME/Ops",
			"--granularity",
			"period",
		])
		.unwrap();

		let Command::Create(args) = cli.command else { panic!("expected create") };
		let scope = args.into_scope();
		assert_eq!(scope.segments.len(), 2);
		assert_eq!(scope.granularity, Granularity::Period);
	}

	#[test]
	fn create_needs_a_segment() {
		assert!(Cli::try_parse_from(["closer", "create", "--from", "2025-01-01", "--to", "2025-01-31"]).is_err());
	}

	#[test]
	fn global_flags_after_subcommand() {
		let cli = Cli::try_parse_from(["closer", "status", "01J", "--json", "--db", "/tmp/x.db"]).unwrap();
		assert!(cli.json);
		assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
	}
}
