//! Shared types for the materialized-view engine.

pub mod types;

pub use types::{EntityKey, Row, SequenceId, WorkerId};
