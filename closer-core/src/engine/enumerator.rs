//! Deterministic expansion of a [`Scope`] into work units.
//!
//! Order is fixed: date windows ascending, then segments by
//! `(company, cost_center)`. Resume relies on this order never changing for a
//! given scope, so the ledger can be matched back against a fresh enumeration.

use chrono::{Days, NaiveDate};

use crate::models::{Granularity, Scope, Segment, WorkUnit};

/// Restartable iterator over a scope's units. Cloning restarts nothing; call
/// [`enumerate`] again for a fresh pass.
#[derive(Debug, Clone)]
pub struct Units {
	scope_start: NaiveDate,
	scope_end: NaiveDate,
	granularity: Granularity,
	segments: Vec<Segment>,
	next: u64,
	len: u64,
}

pub fn enumerate(scope: &Scope) -> Units {
	Units {
		scope_start: scope.period_start,
		scope_end: scope.period_end,
		granularity: scope.granularity,
		segments: scope.segments.iter().cloned().collect(),
		next: 0,
		len: unit_count(scope),
	}
}

pub fn unit_count(scope: &Scope) -> u64 {
	let windows = match scope.granularity {
		Granularity::Daily => scope.days(),
		Granularity::Period if scope.days() > 0 => 1,
		Granularity::Period => 0,
	};
	windows * scope.segments.len() as u64
}

/// The unit at `sequence`, or `None` past the end.
pub fn unit_at(scope: &Scope, sequence: u64) -> Option<WorkUnit> {
	let mut units = enumerate(scope);
	units.next = sequence;
	units.next()
}

impl Units {
	fn build(&self, sequence: u64) -> WorkUnit {
		let per_window = self.segments.len() as u64;
		let window = sequence / per_window;
		let segment = self.segments[(sequence % per_window) as usize].clone();

		let (from, to) = match self.granularity {
			Granularity::Daily => {
				let day = self.scope_start + Days::new(window);
				(day, day)
			}
			Granularity::Period => (self.scope_start, self.scope_end),
		};

		WorkUnit { key: unit_key(&segment, self.granularity, from, to), sequence, segment, from, to }
	}
}

impl Iterator for Units {
	type Item = WorkUnit;

	fn next(&mut self) -> Option<WorkUnit> {
		if self.next >= self.len {
			return None;
		}
		let unit = self.build(self.next);
		self.next += 1;
		Some(unit)
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		let remaining = self.len.saturating_sub(self.next) as usize;
		(remaining, Some(remaining))
	}
}

impl ExactSizeIterator for Units {}

fn unit_key(segment: &Segment, granularity: Granularity, from: NaiveDate, to: NaiveDate) -> String {
	match granularity {
		Granularity::Daily => format!("{}/{}@{from}", segment.company, segment.cost_center),
		Granularity::Period => format!("{}/{}@{from}..{to}", segment.company, segment.cost_center),
	}
}
