//! The streaming update tick and the completion-application paths.
//!
//! One tick runs, in order: viewer pairing and box planning, the data diff
//! (loads/unloads), the mesh-map diff (enter/exit), removal of unpaired
//! viewers, meshing triggered by loaded data, activation triggered by loaded
//! meshes, and transition-mask refresh. Load completions consumed by the
//! later steps see the mesh map produced by the earlier ones.

use std::sync::Arc;

use glam::{IVec3, Mat4};
use tracing::{debug, warn};

use strata_config::StreamingConfig;
use strata_voxel::{BlockToSave, VoxelBuffer, VoxelDataGrid};

use crate::activation::{
    process_loaded_data_blocks_trigger_meshing, process_loaded_mesh_blocks_trigger_visibility_changes,
};
use crate::clipbox::process_viewers;
use crate::data_diff::process_data_blocks_sliding_box;
use crate::error::StreamingError;
use crate::mesh_diff::process_mesh_blocks_sliding_box;
use crate::state::{BlockLocation, MeshState, PairedViewer, StreamingState};
use crate::tasks::{MeshPayload, TaskResult};
use crate::viewer::ViewerRegistry;

/// Run one full streaming update tick.
///
/// `can_load` gates the emission of load requests (e.g. a client waiting on
/// a server connection); `can_mesh` gates mesh requirements entirely
/// (server-only instances that produce no visuals).
#[allow(clippy::too_many_arguments)]
pub fn process_clipbox_streaming(
    state: &mut StreamingState,
    grid: &mut VoxelDataGrid,
    viewers: &ViewerRegistry,
    volume_transform: Mat4,
    data_blocks_to_save: &mut Vec<BlockToSave>,
    data_blocks_to_load: &mut Vec<BlockLocation>,
    config: &StreamingConfig,
    can_load: bool,
    can_mesh: bool,
) -> Result<(), StreamingError> {
    let mut unpaired_viewers_to_remove: Vec<usize> = Vec::new();

    process_viewers(
        state,
        config,
        viewers,
        volume_transform,
        grid.bounds(),
        can_mesh,
        &mut unpaired_viewers_to_remove,
    )?;

    let streaming_enabled = grid.is_streaming_enabled();
    if streaming_enabled {
        process_data_blocks_sliding_box(
            state,
            grid,
            data_blocks_to_save,
            data_blocks_to_load,
            config,
            can_load,
        );
    } else if !grid.is_full_load_completed() {
        // Mesh blocks created now would never learn when to polygonize:
        // meshing in full-load mode is triggered at creation, so wait.
        return Ok(());
    }

    process_mesh_blocks_sliding_box(state, config, grid.bounds(), !streaming_enabled, can_load);

    // Removal happens after the diffs: viewer removal is expressed as boxes
    // shrinking to nothing, which needs one diff pass to emit the unloads.
    remove_unpaired_viewers(&mut state.paired_viewers, &unpaired_viewers_to_remove);

    if streaming_enabled {
        process_loaded_data_blocks_trigger_meshing(state, grid, config);
    }

    process_loaded_mesh_blocks_trigger_visibility_changes(state, config.update_transition_masks);

    Ok(())
}

/// Swap-remove paired viewers flagged by the planner. `indices` is in
/// ascending order; removing back to front keeps earlier indices valid.
pub fn remove_unpaired_viewers(paired_viewers: &mut Vec<PairedViewer>, indices: &[usize]) {
    for &index in indices.iter().rev() {
        debug!(viewer = ?paired_viewers[index].id, "unpairing viewer");
        paired_viewers.swap_remove(index);
    }
}

/// Install a completed data load. Completions whose key is gone from
/// `loading_blocks` were cancelled mid-flight and are dropped.
pub fn apply_loaded_data_block(
    state: &mut StreamingState,
    grid: &mut VoxelDataGrid,
    position: IVec3,
    lod_index: u8,
    voxels: Arc<VoxelBuffer>,
) {
    let lod = &mut state.lods[lod_index as usize];
    let Some(loading_block) = lod.loading_blocks.remove(&position) else {
        debug!(?position, lod_index, "dropping load completion for cancelled block");
        return;
    };

    grid.insert_loaded_block(position, lod_index as u32, voxels, loading_block.viewers.get());

    state
        .loaded_data_blocks
        .lock()
        .unwrap()
        .push(BlockLocation { position, lod_index });
}

/// Drain the per-LOD pending queues into build requests, marking each block
/// `UpdateSent`.
pub fn take_mesh_updates_to_send(state: &mut StreamingState) -> Vec<BlockLocation> {
    let mut out = Vec::new();
    for (lod_index, lod) in state.lods.iter_mut().enumerate() {
        if lod.mesh_blocks_pending_update.is_empty() {
            continue;
        }
        let mut map = lod.mesh_map.write().unwrap();
        for position in lod.mesh_blocks_pending_update.drain(..) {
            if let Some(mesh_block) = map.get_mut(&position) {
                mesh_block.state = MeshState::UpdateSent;
                out.push(BlockLocation { position, lod_index: lod_index as u8 });
            }
        }
    }
    out
}

/// Outputs of [`apply_task_results`] that are not folded into the streaming
/// state: payloads the renderer consumes directly.
#[derive(Default)]
pub struct AppliedResults {
    pub built_meshes: Vec<(BlockLocation, MeshPayload)>,
    pub virtual_textures: Vec<strata_gpu::VirtualTextureArtifact>,
}

/// Fold a batch of worker results into the streaming state and grid.
pub fn apply_task_results(
    state: &mut StreamingState,
    grid: &mut VoxelDataGrid,
    results: Vec<TaskResult>,
) -> AppliedResults {
    let mut applied = AppliedResults::default();
    for result in results {
        match result {
            TaskResult::DataLoaded { position, lod_index, voxels } => match voxels {
                Some(voxels) => apply_loaded_data_block(state, grid, position, lod_index, voxels),
                None => {
                    // Failed loads are not retried here; the block stays
                    // missing until the boxes move again.
                    warn!(?position, lod_index, "data block load failed");
                    state.lods[lod_index as usize].loading_blocks.remove(&position);
                }
            },
            TaskResult::MeshBuilt { position, lod_index, mesh } => {
                // The worker already flipped `loaded` and posted into the
                // activation inbox; only the payload travels further.
                applied.built_meshes.push((BlockLocation { position, lod_index }, mesh));
            }
            TaskResult::VirtualTextureReady { artifact, .. } => {
                applied.virtual_textures.push(artifact);
            }
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::Viewer;
    use glam::Vec3;
    use strata_math::Box3i;

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            lod_count: 2,
            lod_distance: 32.0,
            view_distance_voxels: 128,
            data_block_size_po2: 4,
            mesh_block_size_po2: 4,
            ..Default::default()
        }
    }

    fn test_grid(config: &StreamingConfig) -> VoxelDataGrid {
        let bounds = Box3i::new(IVec3::splat(-2048), IVec3::splat(4096));
        VoxelDataGrid::new(bounds, config.data_block_size_po2, config.lod_count, true)
    }

    fn viewer_at(x: f32) -> Viewer {
        Viewer {
            world_position: Vec3::new(x, 0.0, 0.0),
            view_distance: 64.0,
            requires_visuals: true,
            requires_collisions: false,
        }
    }

    fn tick(
        state: &mut StreamingState,
        grid: &mut VoxelDataGrid,
        viewers: &ViewerRegistry,
        config: &StreamingConfig,
    ) -> (Vec<BlockToSave>, Vec<BlockLocation>) {
        let mut to_save = Vec::new();
        let mut to_load = Vec::new();
        process_clipbox_streaming(
            state,
            grid,
            viewers,
            Mat4::IDENTITY,
            &mut to_save,
            &mut to_load,
            config,
            true,
            true,
        )
        .unwrap();
        (to_save, to_load)
    }

    /// A tick with a fresh viewer emits load requests and creates mesh map
    /// entries.
    #[test]
    fn test_first_tick_requests_loads_and_meshes() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);
        let mut viewers = ViewerRegistry::new();
        viewers.add(viewer_at(0.0));

        let (_saves, to_load) = tick(&mut state, &mut grid, &viewers, &config);

        assert!(!to_load.is_empty());
        assert!(!state.lods[0].mesh_map.read().unwrap().is_empty());
        assert!(!state.lods[1].mesh_map.read().unwrap().is_empty());
        assert!(!state.lods[0].loading_blocks.is_empty());
    }

    /// Round-trip: pairing a viewer, moving it, then removing it leaves no
    /// residual state anywhere.
    #[test]
    fn test_viewer_round_trip_leaves_no_residue() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);
        let mut viewers = ViewerRegistry::new();
        let id = viewers.add(viewer_at(0.0));

        tick(&mut state, &mut grid, &viewers, &config);

        viewers.get_mut(id).unwrap().world_position = Vec3::new(300.0, 0.0, 0.0);
        tick(&mut state, &mut grid, &viewers, &config);

        viewers.remove(id);
        tick(&mut state, &mut grid, &viewers, &config);

        assert!(state.paired_viewers.is_empty());
        for lod_index in 0..config.lod_count {
            let lod = &state.lods[lod_index as usize];
            assert!(lod.loading_blocks.is_empty(), "lod {lod_index} loading residue");
            assert!(
                lod.mesh_map.read().unwrap().is_empty(),
                "lod {lod_index} mesh map residue"
            );
            assert_eq!(grid.loaded_block_count(lod_index), 0, "lod {lod_index} grid residue");
        }
    }

    /// Two viewers: removing one unloads only the blocks it alone viewed,
    /// and leaves the other's boxes untouched.
    #[test]
    fn test_removing_one_viewer_keeps_the_other() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);
        let mut viewers = ViewerRegistry::new();
        let a = viewers.add(viewer_at(0.0));
        tick(&mut state, &mut grid, &viewers, &config);

        let b = viewers.add(viewer_at(512.0));
        let (_, to_load_b) = tick(&mut state, &mut grid, &viewers, &config);

        // Complete every requested load so the grid holds real blocks.
        for bloc in to_load_b {
            apply_loaded_data_block(
                &mut state,
                &mut grid,
                bloc.position,
                bloc.lod_index,
                Arc::new(VoxelBuffer::new(16, 0)),
            );
        }

        let b_state_before = state
            .paired_viewers
            .iter()
            .find(|pv| pv.id == b)
            .unwrap()
            .state
            .clone();

        viewers.remove(a);
        tick(&mut state, &mut grid, &viewers, &config);

        assert_eq!(state.paired_viewers.len(), 1);
        let pv_b = &state.paired_viewers[0];
        assert_eq!(pv_b.id, b);
        assert_eq!(pv_b.state.data_box_per_lod, b_state_before.data_box_per_lod);
        assert_eq!(pv_b.state.mesh_box_per_lod, b_state_before.mesh_box_per_lod);

        // Every surviving grid block is inside B's data boxes.
        for lod_index in 0..config.lod_count {
            let data_box = pv_b.state.data_box_per_lod[lod_index as usize];
            let count = grid.loaded_block_count(lod_index);
            let mut inside = 0;
            data_box.for_each_cell(|pos| {
                if grid.get_block(pos, lod_index).is_some() {
                    inside += 1;
                }
            });
            assert_eq!(count, inside, "lod {lod_index}: stray blocks outside B's box");
        }
    }

    /// At most one LOD is active on any given chunk footprint, across load
    /// completions.
    #[test]
    fn test_active_cut_has_no_overlap() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);
        let mut viewers = ViewerRegistry::new();
        viewers.add(viewer_at(0.0));

        let (_, to_load) = tick(&mut state, &mut grid, &viewers, &config);
        for bloc in to_load {
            apply_loaded_data_block(
                &mut state,
                &mut grid,
                bloc.position,
                bloc.lod_index,
                Arc::new(VoxelBuffer::new(16, 0)),
            );
        }
        // Meshing triggers run on the next tick's drain.
        tick(&mut state, &mut grid, &viewers, &config);

        // Pretend every queued mesh build completed.
        let sink = state.mesh_completion_sink();
        for bloc in take_mesh_updates_to_send(&mut state) {
            sink.mark_built(bloc.position, bloc.lod_index);
        }
        tick(&mut state, &mut grid, &viewers, &config);

        // Check the no-overlap invariant: an active LOD0 chunk must not sit
        // under an active LOD1 parent.
        let lod0 = state.lods[0].mesh_map.read().unwrap();
        let lod1 = state.lods[1].mesh_map.read().unwrap();
        let mut active0 = 0;
        for (pos, block) in lod0.iter() {
            if block.active {
                active0 += 1;
                let parent = *pos >> 1;
                if let Some(parent_block) = lod1.get(&parent) {
                    assert!(
                        !parent_block.active,
                        "overlap: LOD0 {pos:?} and LOD1 {parent:?} both active"
                    );
                }
            }
        }
        assert!(active0 > 0, "no LOD0 chunk ever activated");
    }

    #[test]
    fn test_take_mesh_updates_marks_sent() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);
        let pos = IVec3::new(1, 2, 3);
        {
            let mut map = state.lods[0].mesh_map.write().unwrap();
            let mut mb = crate::state::MeshBlockState::new();
            mb.state = MeshState::UpdateNotSent;
            map.insert(pos, mb);
        }
        state.lods[0].mesh_blocks_pending_update.push(pos);

        let sent = take_mesh_updates_to_send(&mut state);
        assert_eq!(sent, vec![BlockLocation { position: pos, lod_index: 0 }]);
        assert_eq!(
            state.lods[0].mesh_map.read().unwrap()[&pos].state,
            MeshState::UpdateSent
        );
        assert!(state.lods[0].mesh_blocks_pending_update.is_empty());
    }

    /// Completions for cancelled loads are dropped silently.
    #[test]
    fn test_cancelled_load_completion_ignored() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);

        apply_loaded_data_block(
            &mut state,
            &mut grid,
            IVec3::ZERO,
            0,
            Arc::new(VoxelBuffer::new(16, 0)),
        );

        assert_eq!(grid.loaded_block_count(0), 0);
        assert!(state.loaded_data_blocks.lock().unwrap().is_empty());
    }
}
