pub mod aggregator;
pub mod classifier;
pub mod detector;
pub mod error;
pub mod http_judge;
pub mod keyword;
pub mod pattern;

pub mod mock;

pub use aggregator::{aggregate, AggregationPolicy};
pub use classifier::{BreakerConfig, CircuitBreaker, ClassifierAdapter, ClassifierOutcome};
pub use detector::Detector;
pub use error::DetectError;
pub use http_judge::HttpJudge;
pub use keyword::{normalize, KeywordScan, KeywordScanner};
pub use mock::{MockJudge, MockVerdict};
pub use pattern::{PatternScan, PatternScanner};
