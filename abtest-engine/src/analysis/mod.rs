//! Statistical analysis of experiment samples.
//!
//! - [`stats`]: descriptive statistics and the pooled t-test
//! - [`models`]: serializable analysis results
//! - `analyzer`: `SignificanceAnalyzer`, which loads data and picks a winner

mod analyzer;
pub mod models;
pub mod stats;

pub use analyzer::{analyze_samples, SignificanceAnalyzer};
pub use models::{AnalysisResult, TestResult, VariantStatistics, WinnerSummary};
pub use stats::{pooled_t_test, DescriptiveStats, TTest};
