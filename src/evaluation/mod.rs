pub mod driver;
pub mod stats;

pub use driver::{Driver, DriverOptions, EvaluationRecord, EvaluationReport, SkipTally};
pub use stats::{MetricStats, StatsSummary};
