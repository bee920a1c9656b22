use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid config {path}: {source}")]
	Parse {
		path: String,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid config: {0}")]
	Invalid(String),
}

/// Top-level `closer.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
	/// Database file. Defaults to the platform data directory.
	pub db_path: Option<PathBuf>,
	pub engine: EngineConfig,
	pub retry: RetryPolicy,
	pub processor: ProcessorConfig,
}

/// What a worker does once a unit has failed for good.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
	/// The first failed unit fails the job.
	#[default]
	FailFast,
	/// Keep processing the remaining units; the job still ends Failed.
	Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
	/// An in-progress claim without a heartbeat for this long is abandoned.
	pub staleness_threshold_secs: u64,
	pub heartbeat_interval_secs: u64,
	/// Wait between claim attempts while another owner holds a fresh claim.
	pub idle_poll_ms: u64,
	pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			staleness_threshold_secs: 300,
			heartbeat_interval_secs: 30,
			idle_poll_ms: 1_000,
			failure_policy: FailurePolicy::FailFast,
		}
	}
}

impl EngineConfig {
	pub fn staleness_threshold(&self) -> chrono::Duration {
		chrono::Duration::seconds(self.staleness_threshold_secs as i64)
	}

	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_secs(self.heartbeat_interval_secs.max(1))
	}

	pub fn idle_poll(&self) -> Duration {
		Duration::from_millis(self.idle_poll_ms)
	}
}

/// Bounded retry with exponential backoff for recoverable unit errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total attempts per unit, the first one included.
	pub max_attempts: u32,
	pub initial_backoff_ms: u64,
	pub multiplier: f64,
	pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { max_attempts: 3, initial_backoff_ms: 500, multiplier: 2.0, max_backoff_ms: 30_000 }
	}
}

impl RetryPolicy {
	/// Delay before the attempt that follows failed attempt number `attempt` (1-based).
	pub fn backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(32) as i32;
		let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
		let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
		Duration::from_millis(capped as u64)
	}

	pub fn allows_another(&self, attempts_so_far: u32) -> bool {
		attempts_so_far < self.max_attempts
	}
}

/// External command run once per unit. See `engine::processor::CommandProcessor`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
	pub command: Option<String>,
	pub args: Vec<String>,
	/// Kill the command after this long and treat the attempt as recoverable.
	pub timeout_secs: Option<u64>,
}

impl Config {
	pub fn from_toml(text: &str, origin: &str) -> Result<Self, ConfigError> {
		let config: Config =
			toml::from_str(text).map_err(|source| ConfigError::Parse { path: origin.to_string(), source })?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = fs::read_to_string(path)
			.map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
		Self::from_toml(&text, &path.display().to_string())
	}

	/// Load `path` if given, otherwise the default location when it exists.
	pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
		match path {
			Some(p) => Self::load(p),
			None => match default_config_path() {
				Some(p) if p.exists() => Self::load(&p),
				_ => Ok(Self::default()),
			},
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.retry.max_attempts == 0 {
			return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
		}
		if self.retry.multiplier < 1.0 {
			return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
		}
		if self.engine.staleness_threshold_secs <= self.engine.heartbeat_interval_secs {
			return Err(ConfigError::Invalid(
				"engine.staleness_threshold_secs must exceed engine.heartbeat_interval_secs".into(),
			));
		}
		Ok(())
	}

	pub fn db_path(&self) -> PathBuf {
		self.db_path.clone().unwrap_or_else(default_db_path)
	}
}

/// ~/.config/closer/closer.toml (platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|d| d.join("closer").join("closer.toml"))
}

/// Data directory for the database and log files.
pub fn data_dir() -> PathBuf {
	dirs::data_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("closer")
}

fn default_db_path() -> PathBuf {
	data_dir().join("closer.db")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_gives_defaults() {
		let config = Config::from_toml("", "test").unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.engine.failure_policy, FailurePolicy::FailFast);
		assert_eq!(config.retry.max_attempts, 3);
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = Config::from_toml(
			r#"
			[engine]
			failure_policy = "continue"

			[retry]
			max_attempts = 5

			[processor]
			command = "/usr/local/bin/close-unit"
			args = ["--post"]
			"#,
			"test",
		)
		.unwrap();

		assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
		assert_eq!(config.engine.staleness_threshold_secs, 300);
		assert_eq!(config.retry.max_attempts, 5);
		assert_eq!(config.retry.initial_backoff_ms, 500);
		assert_eq!(config.processor.command.as_deref(), Some("/usr/local/bin/close-unit"));
		assert_eq!(config.processor.args, vec!["--post".to_string()]);
	}

	#[test]
	fn rejects_zero_attempts() {
		let err = Config::from_toml("[retry]\nmax_attempts = 0\n", "test").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn rejects_staleness_below_heartbeat() {
		let err = Config::from_toml(
			"[engine]\nstaleness_threshold_secs = 10\nheartbeat_interval_secs = 10\n",
			"test",
		)
		.unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn bad_toml_reports_origin() {
		let err = Config::from_toml("[engine\n", "closer.toml").unwrap_err();
		assert!(err.to_string().contains("closer.toml"));
	}

	#[test]
	fn load_reads_file() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("closer.toml");
		fs::write(&path, "db_path = \"/tmp/closer-test.db\"\n").unwrap();

		let config = Config::load(&path).unwrap();
		assert_eq!(config.db_path(), PathBuf::from("/tmp/closer-test.db"));
	}

	#[test]
	fn load_missing_explicit_file_errors() {
		let err = Config::load_or_default(Some(Path::new("/tmp/closer_definitely_not_real.toml"))).unwrap_err();
		assert!(matches!(err, ConfigError::Read { .. }));
	}

	#[test]
	fn backoff_grows_and_caps() {
		let policy = RetryPolicy { max_attempts: 10, initial_backoff_ms: 100, multiplier: 2.0, max_backoff_ms: 500 };
		assert_eq!(policy.backoff(1), Duration::from_millis(100));
		assert_eq!(policy.backoff(2), Duration::from_millis(200));
		assert_eq!(policy.backoff(3), Duration::from_millis(400));
		assert_eq!(policy.backoff(4), Duration::from_millis(500));
		assert_eq!(policy.backoff(40), Duration::from_millis(500));
	}

	#[test]
	fn allows_another_counts_first_attempt() {
		let policy = RetryPolicy { max_attempts: 2, ..RetryPolicy::default() };
		assert!(policy.allows_another(1));
		assert!(!policy.allows_another(2));
	}
}
