//! Mesh-map diffing: mesh chunks entering and leaving each viewer's mesh
//! boxes, with immediate parent re-activation when children leave.

use std::collections::hash_map::Entry;

use strata_config::StreamingConfig;
use strata_math::Box3i;

use crate::state::{MeshBlockState, MeshState, StreamingState};

/// Diff every paired viewer's mesh boxes against the previous tick.
///
/// Entering cells get a `MeshBlockState` and viewer references (in full-load
/// mode they are queued for meshing right away, since there are no data-load
/// events to react to). Leaving cells drop references and are erased at
/// zero; their parent chunk is re-activated immediately so no hole appears
/// while the viewer moves outward.
pub fn process_mesh_blocks_sliding_box(
    state: &mut StreamingState,
    config: &StreamingConfig,
    bounds_in_voxels: Box3i,
    is_full_load_mode: bool,
    can_load: bool,
) {
    let lod_count = state.lod_count();
    let StreamingState { lods, paired_viewers, .. } = state;

    let mut exited_boxes: Vec<Box3i> = Vec::new();

    for paired_viewer in paired_viewers.iter() {
        // Coarse to fine, so we can stop as soon as bounds are out of reach.
        for lod_index in (0..lod_count as usize).rev() {
            let lod_mesh_block_size = config.mesh_block_size() << lod_index;
            let bounds_in_mesh_blocks = bounds_in_voxels.downscaled(lod_mesh_block_size);

            let new_mesh_box = paired_viewer.state.mesh_box_per_lod[lod_index];
            let prev_mesh_box = paired_viewer.prev_state.mesh_box_per_lod[lod_index];

            if !new_mesh_box.intersects(bounds_in_mesh_blocks)
                && !prev_mesh_box.intersects(bounds_in_mesh_blocks)
            {
                break;
            }

            if prev_mesh_box != new_mesh_box {
                // Meshes entering range.
                if can_load {
                    let lod = &mut lods[lod_index];
                    let mut map = lod.mesh_map.write().unwrap();
                    let pending = &mut lod.mesh_blocks_pending_update;

                    new_mesh_box.difference(prev_mesh_box, |box_to_add| {
                        box_to_add.for_each_cell(|bpos| {
                            let mesh_block = match map.entry(bpos) {
                                Entry::Vacant(entry) => {
                                    let mut mesh_block = MeshBlockState::new();
                                    if is_full_load_mode {
                                        // Everything is loaded up-front, so
                                        // meshing is triggered directly
                                        // instead of reacting to data loads.
                                        pending.push(bpos);
                                        mesh_block.state = MeshState::UpdateNotSent;
                                    }
                                    entry.insert(mesh_block)
                                }
                                Entry::Occupied(entry) => entry.into_mut(),
                            };
                            mesh_block.mesh_viewers.add();
                            mesh_block.collision_viewers.add();
                        });
                    });
                }

                // Meshes leaving range.
                exited_boxes.clear();
                prev_mesh_box.difference(new_mesh_box, |b| exited_boxes.push(b));

                if !exited_boxes.is_empty() {
                    {
                        let lod = &mut lods[lod_index];
                        let mut map = lod.mesh_map.write().unwrap();
                        let to_unload = &mut lod.mesh_blocks_to_unload;

                        for out_of_range_box in &exited_boxes {
                            out_of_range_box.for_each_cell(|bpos| {
                                if let Some(mesh_block) = map.get_mut(&bpos) {
                                    mesh_block.mesh_viewers.remove();
                                    mesh_block.collision_viewers.remove();

                                    if mesh_block.mesh_viewers.get() == 0
                                        && mesh_block.collision_viewers.get() == 0
                                    {
                                        map.remove(&bpos);
                                        to_unload.push(bpos);
                                    }
                                }
                            });
                        }
                    }

                    // Immediately show parents where children were removed.
                    // Cheap, because the parent mesh is available most of
                    // the time; at very high speeds holes can still appear
                    // behind the viewer if loading can't keep up.
                    let parent_lod_index = lod_index + 1;
                    if parent_lod_index < lod_count as usize {
                        let child_map_arc = lods[lod_index].mesh_map.clone();
                        let parent_map_arc = lods[parent_lod_index].mesh_map.clone();
                        let child_map = child_map_arc.read().unwrap();
                        let mut parent_map = parent_map_arc.write().unwrap();
                        let to_activate = &mut lods[parent_lod_index].mesh_blocks_to_activate;

                        for out_of_range_box in &exited_boxes {
                            // Never rounds to zero size: non-root boxes are
                            // even by the subdivision rule.
                            let parent_box =
                                Box3i::new(out_of_range_box.pos >> 1, out_of_range_box.size >> 1);

                            parent_box.for_each_cell(|bpos| {
                                let Some(parent_block) = parent_map.get_mut(&bpos) else {
                                    return;
                                };
                                if parent_block.active {
                                    return;
                                }
                                // Only merge if the children are actually
                                // gone: another viewer may still reference
                                // them, and activating the parent would
                                // overlap. Assumes 8 children or none.
                                let first_child = bpos << 1;
                                if child_map.contains_key(&first_child) {
                                    return;
                                }
                                parent_block.active = true;
                                to_activate.push(bpos);
                            });
                        }
                    }
                }
            }

            // Cancel queued updates that left the region; they go back to
            // `NeedUpdate` so they can be re-scheduled if they return.
            {
                let lod = &mut lods[lod_index];
                let mut map = lod.mesh_map.write().unwrap();
                let pending = &mut lod.mesh_blocks_pending_update;
                let mut i = 0;
                while i < pending.len() {
                    let bpos = pending[i];
                    if new_mesh_box.contains_point(bpos) {
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
