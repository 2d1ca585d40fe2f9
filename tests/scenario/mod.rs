//! Deterministic multi-worker scenarios.

mod common;
mod drift_test;
mod pipeline_test;
mod watchdog_test;
