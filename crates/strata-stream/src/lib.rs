//! Clipbox LOD streaming: the state machine that decides, for each observer
//! moving through a large voxel volume, which data and mesh chunks must be
//! resident at which LOD, and coordinates their loading, meshing, visibility
//! activation and unloading.
//!
//! One update task owns the [`StreamingState`] and runs
//! [`update::process_clipbox_streaming`] each tick; background workers run
//! loads, mesh builds and GPU submissions through [`tasks::TaskPool`] and
//! report back through mutex-protected inboxes.

pub mod activation;
pub mod clipbox;
pub mod data_diff;
pub mod error;
pub mod mesh_diff;
pub mod state;
pub mod tasks;
pub mod transition;
pub mod update;
pub mod viewer;

pub use error::StreamingError;
pub use state::{
    BlockLocation, LoadingDataBlock, LodState, MeshBlockState, MeshCompletionSink, MeshMap,
    MeshState, PairedViewer, StreamingState, ViewerBoxState,
};
pub use viewer::{Viewer, ViewerId, ViewerRegistry};
