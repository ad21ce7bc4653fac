//! Configuration for the strata streaming engine.
//!
//! Settings persist to disk as RON files and are validated before the
//! streaming core accepts them: invalid block size relations, out-of-range
//! LOD counts or bounds that don't align with the largest LOD chunk are
//! configuration errors, not runtime surprises.

mod config;
mod error;

pub use config::{MAX_LOD_COUNT, StreamingConfig, VolumeConfig};
pub use error::ConfigError;
