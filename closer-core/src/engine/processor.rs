use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::{
	config::ProcessorConfig,
	models::{Scope, WorkUnit},
};

/// Exit status a unit command uses to ask for a retry (sysexits EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Keep error messages from noisy commands bounded.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UnitError {
	#[error("recoverable: {0}")]
	Recoverable(String),

	#[error("fatal: {0}")]
	Fatal(String),
}

impl UnitError {
	/// Whether this error is retryable (transient) vs a permanent unit failure.
	pub fn is_retryable(&self) -> bool {
		matches!(self, UnitError::Recoverable(_))
	}
}

/// Result of processing one unit; persisted with the unit's ledger record.
pub type UnitOutput = Option<Value>;

/// Performs the closing computation for one unit and posts it.
///
/// `process` must be atomic per unit: either its effect is fully committed or
/// not at all. A unit whose claim went stale may be handed out again, so
/// committing the same unit twice must be harmless.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
	async fn process(&self, job_id: &str, unit: &WorkUnit) -> Result<UnitOutput, UnitError>;

	/// Runs once after every unit is done, with the outputs in unit order.
	/// Its result is stored as the job total.
	async fn finalize(&self, _job_id: &str, _scope: &Scope, _outputs: &[(String, Value)]) -> Result<UnitOutput, UnitError> {
		Ok(None)
	}
}

/// Logs units and posts nothing.
pub struct DryRunProcessor;

#[async_trait]
impl UnitProcessor for DryRunProcessor {
	async fn process(&self, job_id: &str, unit: &WorkUnit) -> Result<UnitOutput, UnitError> {
		debug!(job_id, unit_key = %unit.key, "dry run");
		Ok(Some(json!({ "unit": unit.key, "from": unit.from, "to": unit.to })))
	}

	async fn finalize(&self, _job_id: &str, _scope: &Scope, outputs: &[(String, Value)]) -> Result<UnitOutput, UnitError> {
		Ok(Some(json!({ "units": outputs.len() })))
	}
}

/// Runs an external program once per unit.
///
/// The unit is passed as `CLOSER_*` environment variables. Exit 0 succeeds and
/// non-empty stdout is parsed as the unit's JSON output; exit 75 is
/// recoverable; anything else is fatal. For the finalize phase the program is
/// started with `CLOSER_PHASE=finalize` and receives the unit outputs as a JSON
/// array on stdin.
pub struct CommandProcessor {
	program: String,
	args: Vec<String>,
	timeout: Option<Duration>,
}

impl CommandProcessor {
	pub fn new(program: impl Into<String>) -> Self {
		Self { program: program.into(), args: Vec::new(), timeout: None }
	}

	/// `None` when the config names no command.
	pub fn from_config(config: &ProcessorConfig) -> Option<Self> {
		let program = config.command.clone()?;
		Some(Self {
			program,
			args: config.args.clone(),
			timeout: config.timeout_secs.map(Duration::from_secs),
		})
	}

	pub fn with_args<I>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = String>,
	{
		self.args = args.into_iter().collect();
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	fn command(&self, job_id: &str, phase: &str) -> Command {
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args)
			.env("CLOSER_JOB_ID", job_id)
			.env("CLOSER_PHASE", phase)
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		cmd
	}

	async fn run(&self, mut cmd: Command, stdin: Option<Vec<u8>>) -> Result<UnitOutput, UnitError> {
		cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
		let mut child = cmd.spawn().map_err(|e| map_spawn_error(e, &self.program))?;

		// Stdin is fed while stdout and stderr drain, or a chatty child fills
		// its pipe and both sides block.
		let pipe = child.stdin.take();
		let feed = async move {
			if let (Some(bytes), Some(mut pipe)) = (stdin, pipe) {
				match pipe.write_all(&bytes).await {
					// The child exited without reading everything; its status says why.
					Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
					_ => {}
				}
			}
			// Dropping the pipe lets the child see EOF.
			Ok(())
		};
		let exchange = async {
			let (fed, output) = tokio::join!(feed, child.wait_with_output());
			fed.map_err(|e| UnitError::Recoverable(format!("{}: writing stdin: {e}", self.program)))?;
			output.map_err(|e| UnitError::Recoverable(format!("{}: {e}", self.program)))
		};

		let output = match self.timeout {
			Some(limit) => tokio::time::timeout(limit, exchange)
				.await
				.map_err(|_| UnitError::Recoverable(format!("{} timed out after {limit:?}", self.program)))??,
			None => exchange.await?,
		};

		let stderr = tail(&String::from_utf8_lossy(&output.stderr));
		match output.status.code() {
			Some(0) => parse_stdout(&output.stdout),
			Some(EXIT_TEMPFAIL) => Err(UnitError::Recoverable(format!("{} asked for retry: {stderr}", self.program))),
			Some(code) => Err(UnitError::Fatal(format!("{} exited with {code}: {stderr}", self.program))),
			None => Err(UnitError::Recoverable(format!("{} killed by signal: {stderr}", self.program))),
		}
	}
}

#[async_trait]
impl UnitProcessor for CommandProcessor {
	async fn process(&self, job_id: &str, unit: &WorkUnit) -> Result<UnitOutput, UnitError> {
		let mut cmd = self.command(job_id, "unit");
		cmd.env("CLOSER_UNIT_KEY", &unit.key)
			.env("CLOSER_UNIT_SEQUENCE", unit.sequence.to_string())
			.env("CLOSER_COMPANY", &unit.segment.company)
			.env("CLOSER_COST_CENTER", &unit.segment.cost_center)
			.env("CLOSER_FROM", unit.from.to_string())
			.env("CLOSER_TO", unit.to.to_string());
		self.run(cmd, None).await
	}

	async fn finalize(&self, job_id: &str, scope: &Scope, outputs: &[(String, Value)]) -> Result<UnitOutput, UnitError> {
		let mut cmd = self.command(job_id, "finalize");
		cmd.env("CLOSER_FROM", scope.period_start.to_string())
			.env("CLOSER_TO", scope.period_end.to_string());

		let payload: Vec<Value> = outputs.iter().map(|(key, output)| json!({ "unit": key, "output": output })).collect();
		let bytes = serde_json::to_vec(&payload).map_err(|e| UnitError::Fatal(format!("encoding outputs: {e}")))?;
		self.run(cmd, Some(bytes)).await
	}
}

fn parse_stdout(stdout: &[u8]) -> Result<UnitOutput, UnitError> {
	let text = String::from_utf8_lossy(stdout);
	let text = text.trim();
	if text.is_empty() {
		return Ok(None);
	}
	serde_json::from_str(text)
		.map(Some)
		.map_err(|e| UnitError::Fatal(format!("unit output is not JSON: {e}")))
}

fn map_spawn_error(err: io::Error, program: &str) -> UnitError {
	match err.kind() {
		io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
			UnitError::Fatal(format!("cannot run {program}: {err}"))
		}
		_ => UnitError::Recoverable(format!("{program}: {err}")),
	}
}

fn tail(s: &str) -> String {
	let s = s.trim();
	if s.len() <= STDERR_TAIL {
		return s.to_string();
	}
	let mut start = s.len() - STDERR_TAIL;
	while !s.is_char_boundary(start) {
		start += 1;
	}
	format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
	use chrono::NaiveDate;

	use super::*;
	use crate::models::Segment;

	fn unit() -> WorkUnit {
		let day = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
		WorkUnit {
			key: "ACME/Main@2025-01-31".into(),
			sequence: 7,
			segment: Segment::new("ACME", "Main"),
			from: day,
			to: day,
		}
	}

	fn sh(script: &str) -> CommandProcessor {
		CommandProcessor::new("sh").with_args(["-c".to_string(), script.to_string()])
	}

	#[test]
	fn error_classification() {
		assert!(UnitError::Recoverable("lock timeout".into()).is_retryable());
		assert!(!UnitError::Fatal("closed period".into()).is_retryable());
	}

	#[tokio::test]
	async fn command_receives_unit_env_and_returns_json() {
		let p = sh(r#"printf '{"key":"%s","company":"%s","from":"%s","phase":"%s"}' "$CLOSER_UNIT_KEY" "$CLOSER_COMPANY" "$CLOSER_FROM" "$CLOSER_PHASE""#);
		let output = p.process("job-1", &unit()).await.unwrap().unwrap();
		assert_eq!(output["key"], "ACME/Main@2025-01-31");
		assert_eq!(output["company"], "ACME");
		assert_eq!(output["from"], "2025-01-31");
		assert_eq!(output["phase"], "unit");
	}

	#[tokio::test]
	async fn empty_stdout_is_no_output() {
		assert_eq!(sh("true").process("job-1", &unit()).await.unwrap(), None);
	}

	#[tokio::test]
	async fn tempfail_is_recoverable() {
		let err = sh("echo 'ledger busy' >&2; exit 75").process("job-1", &unit()).await.unwrap_err();
		assert!(err.is_retryable());
		assert!(err.to_string().contains("ledger busy"));
	}

	#[tokio::test]
	async fn other_exit_codes_are_fatal() {
		let err = sh("exit 3").process("job-1", &unit()).await.unwrap_err();
		assert!(matches!(err, UnitError::Fatal(_)));
	}

	#[tokio::test]
	async fn non_json_stdout_is_fatal() {
		let err = sh("echo not-json").process("job-1", &unit()).await.unwrap_err();
		assert!(matches!(err, UnitError::Fatal(_)));
	}

	#[tokio::test]
	async fn missing_program_is_fatal() {
		let err = CommandProcessor::new("/tmp/closer_definitely_not_real")
			.process("job-1", &unit())
			.await
			.unwrap_err();
		assert!(matches!(err, UnitError::Fatal(_)));
	}

	#[tokio::test]
	async fn timeout_is_recoverable() {
		let err = sh("sleep 5").with_timeout(Duration::from_millis(100)).process("job-1", &unit()).await.unwrap_err();
		assert!(err.is_retryable());
	}

	#[tokio::test]
	async fn finalize_reads_outputs_from_stdin() {
		let p = sh(r#"test "$CLOSER_PHASE" = finalize || exit 9; n=$(cat | grep -o '"unit"' | wc -l); printf '{"units":%d}' $n"#);
		let scope = Scope::new(unit().from, unit().to, [Segment::new("ACME", "Main")]);
		let outputs = vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))];

		let total = p.finalize("job-1", &scope, &outputs).await.unwrap().unwrap();
		assert_eq!(total["units"], 2);
	}

	fn many_outputs() -> Vec<(String, Value)> {
		(0..20_000).map(|i| (format!("ACME/Main@{i:05}"), json!({ "debit": i, "credit": i }))).collect()
	}

	#[tokio::test]
	async fn finalize_drains_output_while_feeding_stdin() {
		// Fills the stderr pipe before reading any input.
		let p = sh(r#"head -c 262144 /dev/zero | tr '\0' x >&2; cat >/dev/null; printf '{"ok":true}'"#);
		let scope = Scope::new(unit().from, unit().to, [Segment::new("ACME", "Main")]);

		let total = tokio::time::timeout(Duration::from_secs(10), p.finalize("job-1", &scope, &many_outputs()))
			.await
			.expect("finalize blocked on its pipes")
			.unwrap()
			.unwrap();
		assert_eq!(total["ok"], true);
	}

	#[tokio::test]
	async fn child_that_ignores_stdin_reports_its_exit_status() {
		let scope = Scope::new(unit().from, unit().to, [Segment::new("ACME", "Main")]);
		let err = sh("exit 3").finalize("job-1", &scope, &many_outputs()).await.unwrap_err();
		assert!(matches!(err, UnitError::Fatal(_)));
	}

	#[tokio::test]
	async fn dry_run_describes_unit() {
		let output = DryRunProcessor.process("job-1", &unit()).await.unwrap().unwrap();
		assert_eq!(output["unit"], "ACME/Main@2025-01-31");
	}

	#[test]
	fn from_config_requires_command() {
		assert!(CommandProcessor::from_config(&ProcessorConfig::default()).is_none());
		let config = ProcessorConfig { command: Some("close-unit".into()), args: vec![], timeout_secs: Some(9) };
		let p = CommandProcessor::from_config(&config).unwrap();
		assert_eq!(p.timeout, Some(Duration::from_secs(9)));
	}

	#[test]
	fn tail_keeps_end_of_long_text() {
		let long = "x".repeat(STDERR_TAIL + 10) + "END";
		let t = tail(&long);
		assert!(t.starts_with("..."));
		assert!(t.ends_with("END"));
	}
}
