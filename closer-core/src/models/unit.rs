use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::scope::Segment;

/// The atomic slice of a job: one segment over one date window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkUnit {
	pub key: String,
	pub sequence: u64,
	pub segment: Segment,
	pub from: NaiveDate,
	pub to: NaiveDate,
}
