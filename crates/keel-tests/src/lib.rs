//! Cross-crate test suite for Keel.
//!
//! End-to-end scenarios drive a `Blockchain` the way a sync layer would;
//! the adversarial suite checks the engine invariants under randomized
//! inputs.

pub mod helpers;
