use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScopeError {
	#[error("period starts after it ends: {start} > {end}")]
	InvertedPeriod { start: NaiveDate, end: NaiveDate },

	#[error("scope has no segments")]
	NoSegments,

	#[error("segment has a blank company or cost center")]
	BlankSegment,
}

/// One company/cost-center pair. Ordered by company first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
	pub company: String,
	pub cost_center: String,
}

impl Segment {
	pub fn new(company: impl Into<String>, cost_center: impl Into<String>) -> Self {
		Self { company: company.into(), cost_center: cost_center.into() }
	}
}

/// How a segment's period is sliced into work units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
	/// One unit per posting date.
	#[default]
	Daily,
	/// One unit for the whole period.
	Period,
}

/// What a closing job covers: an inclusive date range over a set of segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
	pub period_start: NaiveDate,
	pub period_end: NaiveDate,
	pub segments: BTreeSet<Segment>,
	#[serde(default)]
	pub granularity: Granularity,
}

impl Scope {
	pub fn new<I>(period_start: NaiveDate, period_end: NaiveDate, segments: I) -> Self
	where
		I: IntoIterator<Item = Segment>,
	{
		Self {
			period_start,
			period_end,
			segments: segments.into_iter().collect(),
			granularity: Granularity::default(),
		}
	}

	pub fn with_granularity(mut self, granularity: Granularity) -> Self {
		self.granularity = granularity;
		self
	}

	pub fn validate(&self) -> Result<(), ScopeError> {
		if self.period_start > self.period_end {
			return Err(ScopeError::InvertedPeriod { start: self.period_start, end: self.period_end });
		}
		if self.segments.is_empty() {
			return Err(ScopeError::NoSegments);
		}
		if self
			.segments
			.iter()
			.any(|s| s.company.trim().is_empty() || s.cost_center.trim().is_empty())
		{
			return Err(ScopeError::BlankSegment);
		}
		Ok(())
	}

	/// Number of calendar days in the period, inclusive.
	pub fn days(&self) -> u64 {
		if self.period_start > self.period_end {
			return 0;
		}
		(self.period_end - self.period_start).num_days() as u64 + 1
	}

	/// Two scopes overlap when their periods intersect and they share a segment.
	pub fn overlaps(&self, other: &Scope) -> bool {
		let periods_intersect = self.period_start <= other.period_end && other.period_start <= self.period_end;
		periods_intersect && !self.segments.is_disjoint(&other.segments)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn date(y: i32, m: u32, d: u32) -> NaiveDate {
		NaiveDate::from_ymd_opt(y, m, d).unwrap()
	}

	fn scope(start: NaiveDate, end: NaiveDate, segments: &[(&str, &str)]) -> Scope {
		Scope::new(start, end, segments.iter().map(|(c, cc)| Segment::new(*c, *cc)))
	}

	#[test]
	fn valid_scope_passes() {
		let s = scope(date(2025, 1, 1), date(2025, 1, 31), &[("ACME", "Main")]);
		assert!(s.validate().is_ok());
		assert_eq!(s.days(), 31);
	}

	#[test]
	fn inverted_period_rejected() {
		let s = scope(date(2025, 2, 1), date(2025, 1, 1), &[("ACME", "Main")]);
		assert!(matches!(s.validate(), Err(ScopeError::InvertedPeriod { .. })));
		assert_eq!(s.days(), 0);
	}

	#[test]
	fn empty_and_blank_segments_rejected() {
		let empty = scope(date(2025, 1, 1), date(2025, 1, 1), &[]);
		assert_eq!(empty.validate(), Err(ScopeError::NoSegments));

		let blank = scope(date(2025, 1, 1), date(2025, 1, 1), &[("ACME", "  ")]);
		assert_eq!(blank.validate(), Err(ScopeError::BlankSegment));
	}

	#[test]
	fn duplicate_segments_collapse() {
		let s = scope(date(2025, 1, 1), date(2025, 1, 1), &[("ACME", "Main"), ("ACME", "Main")]);
		assert_eq!(s.segments.len(), 1);
	}

	#[test]
	fn overlap_needs_shared_segment_and_dates() {
		let a = scope(date(2025, 1, 1), date(2025, 1, 31), &[("ACME", "Main"), ("ACME", "Ops")]);
		let same_seg_later = scope(date(2025, 2, 1), date(2025, 2, 28), &[("ACME", "Main")]);
		let same_seg_touching = scope(date(2025, 1, 31), date(2025, 2, 28), &[("ACME", "Ops")]);
		let other_seg = scope(date(2025, 1, 1), date(2025, 1, 31), &[("Globex", "Main")]);

		assert!(!a.overlaps(&same_seg_later));
		assert!(a.overlaps(&same_seg_touching));
		assert!(same_seg_touching.overlaps(&a));
		assert!(!a.overlaps(&other_seg));
	}

	#[test]
	fn granularity_defaults_to_daily_when_missing() {
		let json = r#"{"period_start":"2025-01-01","period_end":"2025-01-02","segments":[{"company":"ACME","cost_center":"Main"}]}"#;
		let s: Scope = serde_json::from_str(json).unwrap();
		assert_eq!(s.granularity, Granularity::Daily);
	}
}
