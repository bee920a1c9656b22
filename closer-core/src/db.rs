use std::path::Path;

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
	#[error("failed to create data directory {path}: {source}")]
	CreateDir {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("database error: {0}")]
	Surreal(#[from] surrealdb::Error),
}

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

/// Open (or create) the on-disk database and apply the schema.
pub async fn open(path: &Path) -> Result<DbHandle, DbError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.map_err(|source| DbError::CreateDir { path: parent.display().to_string(), source })?;
	}
	let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await?;
	init(db).await
}

/// Throwaway in-memory database with the same schema.
pub async fn open_memory() -> Result<DbHandle, DbError> {
	let db = Surreal::new::<Mem>(()).await?;
	init(db).await
}

async fn init(db: Surreal<Db>) -> Result<DbHandle, DbError> {
	db.use_ns("closer").use_db("closer").await?;
	run_migrations(&db).await?;
	Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), DbError> {
	db.query(SCHEMA_V1).await?.check()?;
	Ok(())
}

// Timestamps are epoch milliseconds. Scope, total and output are JSON text.
const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE job SCHEMAFULL;
    DEFINE FIELD OVERWRITE key ON job TYPE string;
    DEFINE FIELD OVERWRITE scope ON job TYPE string;
    DEFINE FIELD OVERWRITE status ON job TYPE string;
    DEFINE FIELD OVERWRITE created_at ON job TYPE int;
    DEFINE FIELD OVERWRITE started_at ON job TYPE option<int>;
    DEFINE FIELD OVERWRITE last_transition_at ON job TYPE int;
    DEFINE FIELD OVERWRITE pause_requested ON job TYPE bool DEFAULT false;
    DEFINE FIELD OVERWRITE cancel_requested ON job TYPE bool DEFAULT false;
    DEFINE FIELD OVERWRITE total_units ON job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE total ON job TYPE option<string>;
    DEFINE FIELD OVERWRITE last_error ON job TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_job_key ON job FIELDS key UNIQUE;
    DEFINE INDEX OVERWRITE idx_job_status ON job FIELDS status;

    DEFINE TABLE OVERWRITE progress SCHEMAFULL;
    DEFINE FIELD OVERWRITE job_id ON progress TYPE string;
    DEFINE FIELD OVERWRITE unit_key ON progress TYPE string;
    DEFINE FIELD OVERWRITE sequence ON progress TYPE int;
    DEFINE FIELD OVERWRITE status ON progress TYPE string;
    DEFINE FIELD OVERWRITE attempts ON progress TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE retryable ON progress TYPE bool DEFAULT false;
    DEFINE FIELD OVERWRITE owner ON progress TYPE option<string>;
    DEFINE FIELD OVERWRITE heartbeat_at ON progress TYPE option<int>;
    DEFINE FIELD OVERWRITE completed_at ON progress TYPE option<int>;
    DEFINE FIELD OVERWRITE last_error ON progress TYPE option<string>;
    DEFINE FIELD OVERWRITE output ON progress TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_progress_unit ON progress FIELDS job_id, unit_key UNIQUE;
    DEFINE INDEX OVERWRITE idx_progress_seq ON progress FIELDS job_id, sequence;
";

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn migrations_are_idempotent() {
		let handle = open_memory().await.unwrap();
		run_migrations(&handle.db).await.unwrap();
	}

	#[tokio::test]
	async fn open_creates_parent_dirs() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("nested").join("closer.db");
		let handle = open(&path).await.unwrap();
		handle.db.query("SELECT * FROM job").await.unwrap().check().unwrap();
		assert!(tmp.path().join("nested").exists());
	}
}
