pub mod cycle;

pub use cycle::{CycleOutcome, Executor};
