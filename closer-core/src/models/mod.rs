pub mod job;
pub mod progress;
pub mod scope;
pub mod unit;

pub use job::{Job, JobStatus};
pub use progress::{LedgerSummary, ProgressRecord, UnitStatus};
pub use scope::{Granularity, Scope, ScopeError, Segment};
pub use unit::WorkUnit;
