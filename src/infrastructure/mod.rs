pub mod driver;
pub mod policy;

pub use driver::{ExtractionDriver, SelectionOutcome};
pub use policy::{with_policy, AttemptError, PolicyError, RetryPolicy};
