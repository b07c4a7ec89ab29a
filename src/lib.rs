//! Logical-consistency checks for probabilistic forecasters.
//!
//! Tuples of logically related questions are built by instantiators, a
//! forecaster is elicited on them, and checkers measure how far the answers
//! are from any coherent assignment. The arbitrage solver finds the nearest
//! coherent assignment, which the consistent forecaster uses to correct a
//! base forecaster.

pub mod arbitrage;
pub mod checkers;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod forecasters;
pub mod instantiators;
pub mod llm;
pub mod monitoring;

pub use error::{ConsistencyError, Result};
