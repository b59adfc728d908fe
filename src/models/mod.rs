pub mod job;
pub mod outcome;
pub mod rows;

pub use job::{Job, SelectionStep};
pub use outcome::{FailureKind, JobOutcome, JobRecord, JobReport, SkippedSelection};
pub use rows::{RawPayload, RowSet};
