pub mod output_store;
pub mod payload_merger;

pub use output_store::OutputStore;
pub use payload_merger::merge;
