pub mod fake_federation;
pub mod fixtures;
pub mod recorded_metrics;
