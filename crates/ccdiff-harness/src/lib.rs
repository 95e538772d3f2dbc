//! Differential compiler-testing engine.
//!
//! A campaign generates random programs, builds and runs each one under every
//! configured option-set, and compares the outputs. Disagreements and
//! crashes are triaged (optimization-phase blame, minimization) and stored as
//! failure records under `result/`.
//!
//! The entry point is [`pool::run_campaign`]; [`blame::blame_option_set`]
//! can also be driven on its own for an existing failure.

pub mod blame;
pub mod classifier;
pub mod config;
pub mod model;
pub mod narrative;
pub mod persist;
pub mod pool;
pub mod process;
pub mod reducer;
pub mod registry;
pub mod seeds;
pub mod triage;
pub mod verifier;
