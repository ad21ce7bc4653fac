//! The data grid: per-LOD maps of refcounted data blocks with area
//! view/unview operations driven by the streaming differ.

use std::sync::Arc;

use glam::IVec3;
use rustc_hash::FxHashMap;
use tracing::debug;

use strata_math::Box3i;

use crate::buffer::VoxelBuffer;
use crate::data_block::{DataBlock, RefCount};

/// A block leaving the grid that still has unsaved modifications. Handed to
/// the storage subsystem; the grid keeps nothing.
#[derive(Clone, Debug)]
pub struct BlockToSave {
    pub position: IVec3,
    pub lod_index: u8,
    pub voxels: Arc<VoxelBuffer>,
}

/// Chunked voxel storage across LODs.
///
/// Residency is reference-counted per `(position, lod)`: every viewer whose
/// data box covers a cell holds one reference. Blocks are created when their
/// load completes and destroyed when the last reference is dropped.
pub struct VoxelDataGrid {
    lods: Vec<FxHashMap<IVec3, DataBlock>>,
    bounds_in_voxels: Box3i,
    block_size_po2: u32,
    streaming_enabled: bool,
    full_load_completed: bool,
}

impl VoxelDataGrid {
    pub fn new(
        bounds_in_voxels: Box3i,
        block_size_po2: u32,
        lod_count: u32,
        streaming_enabled: bool,
    ) -> Self {
        Self {
            lods: (0..lod_count).map(|_| FxHashMap::default()).collect(),
            bounds_in_voxels,
            block_size_po2,
            streaming_enabled,
            full_load_completed: false,
        }
    }

    pub fn block_size_po2(&self) -> u32 {
        self.block_size_po2
    }

    pub fn block_size(&self) -> i32 {
        1 << self.block_size_po2
    }

    pub fn lod_count(&self) -> u32 {
        self.lods.len() as u32
    }

    /// Volume bounds in voxels.
    pub fn bounds(&self) -> Box3i {
        self.bounds_in_voxels
    }

    /// Volume bounds in data blocks of the given LOD. Exact as long as the
    /// bounds are a multiple of the largest LOD chunk, which configuration
    /// validation enforces.
    pub fn bounds_in_blocks(&self, lod_index: u32) -> Box3i {
        let po2 = (self.block_size_po2 + lod_index) as i32;
        Box3i::new(self.bounds_in_voxels.pos >> po2, self.bounds_in_voxels.size >> po2)
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.streaming_enabled
    }

    pub fn is_full_load_completed(&self) -> bool {
        self.full_load_completed
    }

    pub fn mark_full_load_completed(&mut self) {
        self.full_load_completed = true;
    }

    pub fn get_block(&self, position: IVec3, lod_index: u32) -> Option<&DataBlock> {
        self.lods[lod_index as usize].get(&position)
    }

    pub fn get_block_mut(&mut self, position: IVec3, lod_index: u32) -> Option<&mut DataBlock> {
        self.lods[lod_index as usize].get_mut(&position)
    }

    pub fn loaded_block_count(&self, lod_index: u32) -> usize {
        self.lods[lod_index as usize].len()
    }

    /// Add one viewer reference to every cell of `area`.
    ///
    /// Cells with no block yet are reported through `out_missing` (the caller
    /// tracks their pending loads); cells with a loaded block are reported
    /// through `out_loaded`.
    pub fn view_area(
        &mut self,
        area: Box3i,
        lod_index: u32,
        mut out_missing: Option<&mut Vec<IVec3>>,
        mut out_loaded: Option<&mut Vec<IVec3>>,
    ) {
        let map = &mut self.lods[lod_index as usize];
        area.for_each_cell(|pos| match map.get_mut(&pos) {
            Some(block) => {
                block.viewers.add();
                if block.is_loaded()
                    && let Some(out) = out_loaded.as_mut()
                {
                    out.push(pos);
                }
            }
            None => {
                if let Some(out) = out_missing.as_mut() {
                    out.push(pos);
                }
            }
        });
    }

    /// Remove one viewer reference from every cell of `area`.
    ///
    /// Blocks whose refcount reaches zero are destroyed: modified ones are
    /// first emitted through `out_to_save`, and every destroyed cell is
    /// reported through `out_found`. Cells with no block are reported through
    /// `out_missing` so the caller can cancel their pending loads.
    pub fn unview_area(
        &mut self,
        area: Box3i,
        lod_index: u32,
        mut out_found: Option<&mut Vec<IVec3>>,
        mut out_missing: Option<&mut Vec<IVec3>>,
        mut out_to_save: Option<&mut Vec<BlockToSave>>,
    ) {
        let map = &mut self.lods[lod_index as usize];
        area.for_each_cell(|pos| {
            let Some(block) = map.get_mut(&pos) else {
                if let Some(out) = out_missing.as_mut() {
                    out.push(pos);
                }
                return;
            };
            if block.viewers.get() == 0 {
                debug!(?pos, lod_index, "unview of a block that was never viewed");
                return;
            }
            if block.viewers.remove() == 0
                && let Some(mut block) = map.remove(&pos)
            {
                if block.is_modified()
                    && let Some(voxels) = block.take_voxels()
                    && let Some(out) = out_to_save.as_mut()
                {
                    out.push(BlockToSave {
                        position: pos,
                        lod_index: lod_index as u8,
                        voxels,
                    });
                }
                if let Some(out) = out_found.as_mut() {
                    out.push(pos);
                }
            }
        });
    }

    /// True when every cell of `area` holds a loaded block.
    pub fn has_all_blocks_in_area(&self, area: Box3i, lod_index: u32) -> bool {
        let map = &self.lods[lod_index as usize];
        let mut all = true;
        area.for_each_cell(|pos| {
            if all && !map.get(&pos).is_some_and(DataBlock::is_loaded) {
                all = false;
            }
        });
        all
    }

    /// Completion path: install a freshly loaded block carrying the viewer
    /// references accumulated while it was pending.
    pub fn insert_loaded_block(
        &mut self,
        position: IVec3,
        lod_index: u32,
        voxels: Arc<VoxelBuffer>,
        viewer_count: u32,
    ) {
        let map = &mut self.lods[lod_index as usize];
        match map.get_mut(&position) {
            Some(block) => {
                // Already present (e.g. created by an edit while loading);
                // just fill in the payload.
                block.set_voxels(voxels);
            }
            None => {
                let mut block = DataBlock::new(position, lod_index as u8, Some(voxels));
                block.viewers = RefCount::new(viewer_count);
                map.insert(position, block);
            }
        }
    }
}
