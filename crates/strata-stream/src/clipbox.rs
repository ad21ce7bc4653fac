//! Per-viewer clipbox planning: the boxes of data and mesh chunks that must
//! be resident around each viewer, per LOD.
//!
//! Viewers can request any view distance, but the computed boxes follow
//! three rules:
//!
//! - parent LOD boxes contain their child boxes (in parent coordinates);
//! - non-root mesh boxes have even position and size, so every parent chunk
//!   maps onto exactly 8 children (subdivision rule);
//! - mesh boxes are contained in data boxes padded by one data chunk, so
//!   meshing always has its neighbor voxels (neighboring rule).

use glam::{IVec3, Mat4, Vec3};
use tracing::debug;

use strata_config::StreamingConfig;
use strata_math::{Box3i, ceil_div, ceil_div_i32, floor_div};

use crate::error::StreamingError;
use crate::state::{PairedViewer, StreamingState};
use crate::viewer::ViewerRegistry;

/// Box of chunks around `center` covering `distance_voxels` in every
/// direction.
///
/// The `+ 1` on the max corner breaks rounding ties: when the distance is a
/// multiple of the chunk size, specific center coordinates would otherwise
/// make the box shrink by one chunk. `make_even` rounds the result outward
/// to even coordinates for the subdivision rule.
pub fn base_box_in_chunks(
    center_voxels: IVec3,
    distance_voxels: i32,
    chunk_size: i32,
    make_even: bool,
) -> Box3i {
    let mut minp = floor_div(center_voxels - IVec3::splat(distance_voxels), chunk_size);
    let mut maxp = ceil_div(center_voxels + IVec3::splat(distance_voxels + 1), chunk_size);

    if make_even {
        minp = floor_div(minp, 2) * 2;
        maxp = ceil_div(maxp, 2) * 2;
    }

    Box3i::from_min_max(minp, maxp)
}

/// How many mesh chunks of detail each LOD keeps before handing over to the
/// next one. Never less than one chunk.
pub fn lod_distance_in_mesh_chunks(lod_distance_voxels: f32, mesh_block_size: i32) -> i32 {
    ((lod_distance_voxels.ceil() as i32) / mesh_block_size).max(1)
}

/// Pair new viewers, flag destroyed ones, and recompute every paired
/// viewer's data and mesh boxes for this tick.
///
/// Destroyed viewers get zeroed boxes (with `prev_state` kept equal to the
/// zeroing) so the differ emits full unloads; their indices are pushed onto
/// `unpaired_viewers_to_remove` for removal after diffing.
pub fn process_viewers(
    state: &mut StreamingState,
    config: &StreamingConfig,
    viewers: &ViewerRegistry,
    volume_transform: Mat4,
    bounds_in_voxels: Box3i,
    can_mesh: bool,
    unpaired_viewers_to_remove: &mut Vec<usize>,
) -> Result<(), StreamingError> {
    if viewers.len() > config.max_viewers as usize {
        return Err(StreamingError::TooManyViewers {
            count: viewers.len(),
            max: config.max_viewers,
        });
    }

    // Destroyed viewers: zero the view distance and boxes so the unload path
    // runs through the exact same diff code, then remove in a second pass.
    for (index, pv) in state.paired_viewers.iter_mut().enumerate() {
        if !viewers.contains(pv.id) {
            debug!(viewer = ?pv.id, "detected destroyed viewer");
            pv.state.view_distance_voxels = 0;
            // Assign prev state first; resetting boxes could otherwise make
            // them equal to a stale prev state and cause no unload.
            pv.prev_state = pv.state.clone();
            for b in &mut pv.state.data_box_per_lod {
                *b = Box3i::ZERO;
            }
            for b in &mut pv.state.mesh_box_per_lod {
                *b = Box3i::ZERO;
            }
            unpaired_viewers_to_remove.push(index);
        }
    }

    let world_to_local = volume_transform.inverse();
    // Uniform scale only: the length of the local-space image of the world
    // X axis.
    let view_distance_scale = world_to_local.transform_vector3(Vec3::X).length();

    let lod_count = config.lod_count;
    let data_block_size = config.data_block_size();
    let mesh_block_size = config.mesh_block_size();
    let mesh_to_data_factor = config.mesh_to_data_factor();

    let lod_distance_mesh_chunks = lod_distance_in_mesh_chunks(config.lod_distance, mesh_block_size);
    // Data chunks are driven by mesh chunks, because meshing needs data.
    let lod_distance_data_chunks = lod_distance_mesh_chunks * mesh_to_data_factor;

    for (viewer_id, viewer) in viewers.iter() {
        let paired_index = match state.paired_viewers.iter().position(|pv| pv.id == viewer_id) {
            Some(i) => i,
            None => {
                debug!(viewer = ?viewer_id, "pairing viewer");
                state.paired_viewers.push(PairedViewer::new(viewer_id, lod_count));
                state.paired_viewers.len() - 1
            }
        };
        let pv = &mut state.paired_viewers[paired_index];

        // Current state becomes the previous state for this tick's diff.
        pv.prev_state = pv.state.clone();

        let view_distance_voxels = (viewer.view_distance * view_distance_scale) as i32;
        pv.state.view_distance_voxels =
            view_distance_voxels.min(config.view_distance_voxels as i32);

        // The root LOD must extend at least to the view distance, and never
        // less than the per-LOD detail distance.
        let last_lod_mesh_block_size = mesh_block_size << (lod_count - 1);
        let last_lod_distance_mesh_chunks =
            ceil_div_i32(pv.state.view_distance_voxels, last_lod_mesh_block_size)
                .max(lod_distance_mesh_chunks);

        let local_position = world_to_local.transform_point3(viewer.world_position);
        pv.state.local_position_voxels = local_position.floor().as_ivec3();
        pv.state.requires_collisions = viewer.requires_collisions;
        pv.state.requires_meshes = viewer.requires_visuals && can_mesh;

        if pv.state.requires_collisions || pv.state.requires_meshes {
            // Mesh boxes, finest LOD first so each level can wrap its child.
            for lod_index in 0..lod_count {
                let lod_mesh_block_size = mesh_block_size << lod_index;
                let bounds_in_mesh_blocks = bounds_in_voxels.downscaled(lod_mesh_block_size);

                let last = lod_index == lod_count - 1;
                let ld = if last {
                    last_lod_distance_mesh_chunks
                } else {
                    lod_distance_mesh_chunks
                };

                let mut new_mesh_box = base_box_in_chunks(
                    pv.state.local_position_voxels,
                    // A multiple of the chunk size, for consistent box size.
                    ld * lod_mesh_block_size,
                    lod_mesh_block_size,
                    // The root has no parent, so it need not stay even.
                    !last,
                );

                if lod_index > 0 {
                    // Neighboring rule: pad the child box outward so at
                    // least 2 chunks of this LOD separate LOD-1 from LOD+1.
                    // The child's even position and size guarantee the shift
                    // doesn't round to zero.
                    let child_box = pv.state.mesh_box_per_lod[lod_index as usize - 1];
                    let mut min_box =
                        Box3i::new(child_box.pos >> 1, child_box.size >> 1).padded(2);
                    if !last {
                        min_box = min_box.snapped_even_outward();
                    }
                    // Usually a no-op, except when the lod distance is small.
                    new_mesh_box.merge_with(min_box);
                }

                new_mesh_box.clip(bounds_in_mesh_blocks);
                pv.state.mesh_box_per_lod[lod_index as usize] = new_mesh_box;
            }

            // Data boxes follow mesh boxes so the right chunks are loaded to
            // build them, including the neighboring-rule adjustments.
            for lod_index in 0..lod_count {
                let lod_data_po2 = (config.data_block_size_po2 + lod_index) as i32;
                // Exact as long as the bounds are a multiple of the largest
                // LOD chunk.
                let bounds_in_data_blocks = Box3i::new(
                    bounds_in_voxels.pos >> lod_data_po2,
                    bounds_in_voxels.size >> lod_data_po2,
                );

                let mesh_box = pv.state.mesh_box_per_lod[lod_index as usize];
                let data_box = mesh_box
                    .scaled(mesh_to_data_factor)
                    // Meshing reads one chunk of neighbor voxels. This can
                    // break the subdivision rule, but only where meshes
                    // actually spawn.
                    .padded(1)
                    .clipped(bounds_in_data_blocks);

                pv.state.data_box_per_lod[lod_index as usize] = data_box;
            }
        } else {
            for b in &mut pv.state.mesh_box_per_lod {
                *b = Box3i::ZERO;
            }

            for lod_index in 0..lod_count {
                let lod_data_po2 = (config.data_block_size_po2 + lod_index) as i32;
                let lod_data_block_size = data_block_size << lod_index;
                let bounds_in_data_blocks = Box3i::new(
                    bounds_in_voxels.pos >> lod_data_po2,
                    bounds_in_voxels.size >> lod_data_po2,
                );

                let new_data_box = base_box_in_chunks(
                    pv.state.local_position_voxels,
                    lod_distance_data_chunks * lod_data_block_size,
                    lod_data_block_size,
                    lod_index != lod_count - 1,
                )
                .clipped(bounds_in_data_blocks);

                pv.state.data_box_per_lod[lod_index as usize] = new_data_box;
            }
        }
    }

    Ok(())
}
