//! Per-chunk data block state: payload, viewer refcount and edit flags.

use std::sync::Arc;

use glam::IVec3;

use crate::buffer::VoxelBuffer;

/// Small saturating reference counter for viewer residency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCount(u32);

impl RefCount {
    pub fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn add(&mut self) {
        self.0 += 1;
    }

    /// Decrement, returning the new count. Decrementing zero stays at zero;
    /// the caller decides whether that is worth a log line.
    pub fn remove(&mut self) -> u32 {
        self.0 = self.0.saturating_sub(1);
        self.0
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Loaded voxel data for one chunk of the volume at one LOD. Meshes and
/// colliders are stored separately in the per-LOD mesh maps.
#[derive(Clone, Debug)]
pub struct DataBlock {
    pub position: IVec3,
    pub lod_index: u8,
    pub viewers: RefCount,
    voxels: Option<Arc<VoxelBuffer>>,
    /// Differs from the loaded state and should be saved before unload.
    modified: bool,
    /// Edited, so parent LOD counterparts need recomputing.
    needs_lodding: bool,
}

impl DataBlock {
    pub fn new(position: IVec3, lod_index: u8, voxels: Option<Arc<VoxelBuffer>>) -> Self {
        Self {
            position,
            lod_index,
            viewers: RefCount::default(),
            voxels,
            modified: false,
            needs_lodding: false,
        }
    }

    /// True once voxel data has arrived. A block can exist unloaded while a
    /// viewer waits on its load.
    pub fn is_loaded(&self) -> bool {
        self.voxels.is_some()
    }

    /// Shared snapshot of the payload for workers; never blocks.
    pub fn voxels(&self) -> Option<Arc<VoxelBuffer>> {
        self.voxels.clone()
    }

    pub fn set_voxels(&mut self, voxels: Arc<VoxelBuffer>) {
        self.voxels = Some(voxels);
    }

    pub fn take_voxels(&mut self) -> Option<Arc<VoxelBuffer>> {
        self.voxels.take()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    pub fn needs_lodding(&self) -> bool {
        self.needs_lodding
    }

    pub fn set_needs_lodding(&mut self, needs_lodding: bool) {
        self.needs_lodding = needs_lodding;
    }

    /// Edit entry point: marks the block dirty for saving and for LOD
    /// propagation in one step.
    pub fn mark_edited(&mut self) {
        self.modified = true;
        self.needs_lodding = true;
    }
}
