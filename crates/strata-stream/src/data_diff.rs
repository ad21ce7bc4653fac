//! Data-box diffing: loads entering chunks, unloads leaving chunks, and
//! cancellation of pending work that moved out of range.

use glam::IVec3;
use tracing::debug;

use strata_config::StreamingConfig;
use strata_math::Box3i;
use strata_voxel::{BlockToSave, VoxelDataGrid};

use crate::state::{BlockLocation, LoadingDataBlock, LodState, MeshState, StreamingState};

/// Register one more viewer waiting on a pending load. Returns `true` when
/// this was the first, i.e. a load request must be emitted.
fn add_loading_block(lod: &mut LodState, position: IVec3) -> bool {
    match lod.loading_blocks.get_mut(&position) {
        None => {
            let mut loading = LoadingDataBlock::default();
            loading.viewers.add();
            lod.loading_blocks.insert(position, loading);
            true
        }
        Some(loading) => {
            loading.viewers.add();
            false
        }
    }
}

/// Diff every paired viewer's data boxes against the previous tick.
///
/// Entering cells are viewed on the grid (missing ones become pending
/// loads), leaving cells are unviewed (zero-refcount blocks are saved if
/// modified and destroyed, pending loads are cancelled), and queued mesh
/// updates that fell outside the padded data region are reverted to
/// `NeedUpdate`.
pub fn process_data_blocks_sliding_box(
    state: &mut StreamingState,
    grid: &mut VoxelDataGrid,
    blocks_to_save: &mut Vec<BlockToSave>,
    data_blocks_to_load: &mut Vec<BlockLocation>,
    config: &StreamingConfig,
    can_load: bool,
) {
    debug_assert!(grid.is_streaming_enabled(), "not meant to run in full load mode");

    let lod_count = state.lod_count();
    let data_block_size = grid.block_size();
    let mesh_block_size = config.mesh_block_size();

    let mut missing_blocks: Vec<IVec3> = Vec::new();
    let mut found_blocks: Vec<IVec3> = Vec::new();

    let StreamingState { lods, paired_viewers, .. } = state;

    for paired_viewer in paired_viewers.iter() {
        // Coarse to fine, so we can stop as soon as bounds are out of reach.
        for lod_index in (0..lod_count).rev() {
            let bounds_in_data_blocks = grid.bounds_in_blocks(lod_index);

            let new_data_box = paired_viewer.state.data_box_per_lod[lod_index as usize];
            let prev_data_box = paired_viewer.prev_state.data_box_per_lod[lod_index as usize];

            if !new_data_box.intersects(bounds_in_data_blocks)
                && !prev_data_box.intersects(bounds_in_data_blocks)
            {
                // If this box doesn't intersect either now or before, no
                // smaller LOD can either.
                break;
            }

            let lod = &mut lods[lod_index as usize];

            if prev_data_box != new_data_box {
                // Blocks to load.
                if can_load {
                    missing_blocks.clear();
                    new_data_box.difference(prev_data_box, |box_to_load| {
                        grid.view_area(box_to_load, lod_index, Some(&mut missing_blocks), None);
                    });

                    for &bpos in &missing_blocks {
                        if add_loading_block(lod, bpos) {
                            data_blocks_to_load.push(BlockLocation {
                                position: bpos,
                                lod_index: lod_index as u8,
                            });
                        }
                    }
                }

                // Blocks to unload.
                missing_blocks.clear();
                found_blocks.clear();
                prev_data_box.difference(new_data_box, |box_to_remove| {
                    grid.unview_area(
                        box_to_remove,
                        lod_index,
                        Some(&mut found_blocks),
                        Some(&mut missing_blocks),
                        Some(&mut *blocks_to_save),
                    );
                });

                // Unloaded blocks can't be pending anymore.
                for bpos in &found_blocks {
                    lod.loading_blocks.remove(bpos);
                }

                // Drop a pending-load reference; cancel the request when the
                // last viewer moved away.
                for &bpos in &missing_blocks {
                    let Some(loading_block) = lod.loading_blocks.get_mut(&bpos) else {
                        debug!(?bpos, lod_index, "unview of a loading block that was never requested");
                        continue;
                    };

                    if loading_block.viewers.remove() == 0 {
                        lod.loading_blocks.remove(&bpos);

                        let bloc = BlockLocation {
                            position: bpos,
                            lod_index: lod_index as u8,
                        };
                        if let Some(i) = data_blocks_to_load.iter().position(|b| *b == bloc) {
                            data_blocks_to_load.swap_remove(i);
                        }
                    }
                }
            }

            // Cancel mesh updates that are no longer within the padded data
            // region; remeshing always needs its neighbor blocks.
            {
                let padded_new_box = new_data_box.padded(-1);
                let mesh_box = if mesh_block_size > data_block_size {
                    padded_new_box.downscaled_inner(mesh_block_size / data_block_size)
                } else {
                    padded_new_box
                };

                let mut map = lod.mesh_map.write().unwrap();
                let pending = &mut lod.mesh_blocks_pending_update;
                let mut i = 0;
                while i < pending.len() {
                    let bpos = pending[i];
                    if mesh_box.contains_point(bpos) {
                        i += 1;
                    } else {
                        if let Some(mesh_block) = map.get_mut(&bpos) {
                            mesh_block.state = MeshState::NeedUpdate;
                        }
                        pending.swap_remove(i);
                    }
                }
            }
        }
    }
}
