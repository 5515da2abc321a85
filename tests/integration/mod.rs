//! Integration tests for the queue engine, run against the in-memory store
//! via the `test-harness` feature.
//!
//! ## Test organization
//!
//! - **submission**: the submission boundary and durable record creation
//! - **group_exclusivity**: the per-group mutual-exclusion guarantee
//! - **retry_mechanism**: retry classification, budget, and back-off
//! - **recovery**: orphan and self-recovery sweeps
//! - **life_cycle**: engine start-up, backpressure, and shutdown

pub mod group_exclusivity;
pub mod life_cycle;
pub mod recovery;
