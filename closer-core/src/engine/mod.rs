pub mod controller;
pub mod enumerator;
pub mod job_store;
pub mod ledger;
pub mod processor;
pub mod reporter;
pub mod scheduler;
pub mod state;

pub use controller::{ControlError, JobController, TransitionOutcome};
pub use ledger::{ClaimedUnit, LedgerError, ProgressLedger};
pub use processor::{CommandProcessor, DryRunProcessor, UnitError, UnitOutput, UnitProcessor};
pub use reporter::{ChannelObserver, StatusEvent, StatusObserver, StatusReporter, TracingObserver};
