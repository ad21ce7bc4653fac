//! Chunked voxel storage across LODs with refcounted view/unview residency.

pub mod buffer;
pub mod data_block;
pub mod grid;

pub use buffer::VoxelBuffer;
pub use data_block::{DataBlock, RefCount};
pub use grid::{BlockToSave, VoxelDataGrid};
