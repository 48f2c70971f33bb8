//! Shared data types for the skein workflow engine.
//!
//! This crate holds the serde-friendly data shapes and error enums used
//! across the engine: step lifecycle states, lifecycle descriptions, and the
//! step error taxonomy. It has no engine logic and no async dependencies.

pub mod step;
