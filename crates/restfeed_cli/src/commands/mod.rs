//! CLI command implementations.

pub mod changes;
pub mod checkpoints;
pub mod inspect;
