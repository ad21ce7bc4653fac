//! Load-completion reactions: trigger meshing when data dependencies become
//! resident, and run the LOD subdivision protocol when meshes finish
//! building so the rendered cut never shows holes or overlaps.

use glam::IVec3;
use rustc_hash::FxHashSet;
use tracing::error;

use strata_config::StreamingConfig;
use strata_math::{Box3i, child_position};
use strata_voxel::VoxelDataGrid;

use crate::state::{BlockLocation, LodState, MeshState, StreamingState};
use crate::transition::update_transition_masks;

/// Drain the loaded-data inbox and queue meshing for every mesh chunk whose
/// data dependencies just became fully resident.
///
/// Only meaningful with streaming on: in full-load mode meshing is triggered
/// directly when mesh blocks enter range, since load events only arrive for
/// edited areas.
pub fn process_loaded_data_blocks_trigger_meshing(
    state: &mut StreamingState,
    grid: &VoxelDataGrid,
    config: &StreamingConfig,
) {
    debug_assert!(grid.is_streaming_enabled());

    let loaded_blocks: Vec<BlockLocation> = {
        let mut inbox = state.loaded_data_blocks.lock().unwrap();
        std::mem::take(&mut *inbox)
    };
    if loaded_blocks.is_empty() {
        return;
    }

    let data_to_mesh_shift = config.mesh_block_size_po2 - grid.block_size_po2();
    let mut checked_mesh_blocks_per_lod: Vec<FxHashSet<IVec3>> =
        vec![FxHashSet::default(); state.lods.len()];

    for bloc in loaded_blocks {
        // Several mesh blocks can depend on one data block because of
        // neighbor reads.
        let lod_index = bloc.lod_index as u32;
        let bounds_in_data_blocks = grid.bounds_in_blocks(lod_index);

        let data_neighboring = Box3i::new(bloc.position - IVec3::ONE, IVec3::splat(3))
            .clipped(bounds_in_data_blocks);

        let checked_mesh_blocks = &mut checked_mesh_blocks_per_lod[bloc.lod_index as usize];
        let lod = &mut state.lods[bloc.lod_index as usize];
        let mut map = lod.mesh_map.write().unwrap();
        let pending = &mut lod.mesh_blocks_pending_update;

        data_neighboring.for_each_cell(|data_bpos| {
            let mesh_block_pos = data_bpos >> data_to_mesh_shift as i32;
            if !checked_mesh_blocks.insert(mesh_block_pos) {
                return;
            }

            let Some(mesh_block) = map.get_mut(&mesh_block_pos) else {
                // Not requested by any viewer.
                return;
            };
            if mesh_block.state != MeshState::NeedUpdate
                && mesh_block.state != MeshState::NeverUpdated
            {
                // Already updated or updating.
                return;
            }

            // Meshing reads one data chunk of padding around the block.
            let data_box = Box3i::new(
                (mesh_block_pos << data_to_mesh_shift as i32) - IVec3::ONE,
                IVec3::splat((1 << data_to_mesh_shift) + 2),
            )
            .clipped(bounds_in_data_blocks);

            if grid.has_all_blocks_in_area(data_box, lod_index) {
                pending.push(mesh_block_pos);
                mesh_block.state = MeshState::UpdateNotSent;
                // Data blocks won't unload before the mesh task snapshots
                // them: unloading runs earlier in the tick.
            }
        });
    }
}

/// Activate a mesh block that finished building, and run subdivision both
/// ways: a parent hides only when all 8 of its children are ready, and a
/// freshly loaded region recursively re-subdivides into finer LODs.
pub fn update_mesh_block_load(
    lods: &mut [LodState],
    bpos: IVec3,
    lod_index: u32,
    lod_count: u32,
) {
    let loaded = {
        let map = lods[lod_index as usize].mesh_map.read().unwrap();
        match map.get(&bpos) {
            None => return,
            Some(mesh_block) => mesh_block.is_loaded(),
        }
    };
    if !loaded {
        return;
    }

    let parent_lod_index = lod_index + 1;
    if parent_lod_index == lod_count {
        // Root: no siblings to coordinate with, activate directly.
        let newly_active = {
            let mut map = lods[lod_index as usize].mesh_map.write().unwrap();
            match map.get_mut(&bpos) {
                Some(mesh_block) if !mesh_block.active => {
                    mesh_block.active = true;
                    true
                }
                _ => false,
            }
        };
        if newly_active {
            lods[lod_index as usize].mesh_blocks_to_activate.push(bpos);
        }

        if lod_index > 0 {
            for child_index in 0..8 {
                update_mesh_block_load(
                    lods,
                    child_position(bpos, child_index),
                    lod_index - 1,
                    lod_count,
                );
            }
        }
        return;
    }

    // Not root: activation is all-or-nothing across the 8 siblings.
    let parent_bpos = bpos >> 1;

    let parent_active = {
        let parent_map = lods[parent_lod_index as usize].mesh_map.read().unwrap();
        match parent_map.get(&parent_bpos) {
            Some(parent_block) => parent_block.active,
            None => {
                // Sliding boxes contain each other, so the parent should
                // exist. Tolerate and let the next diff re-converge.
                error!(?parent_bpos, parent_lod_index, "expected parent due to subdivision rules");
                return;
            }
        }
    };
    if !parent_active {
        return;
    }

    let all_siblings_loaded = {
        let map = lods[lod_index as usize].mesh_map.read().unwrap();
        let mut all = true;
        for sibling_index in 0..8 {
            let sibling_bpos = child_position(parent_bpos, sibling_index);
            match map.get(&sibling_bpos) {
                None => {
                    // Every mesh block is supposed to have 8 siblings here.
                    error!(?sibling_bpos, lod_index, "missing sibling in mesh map");
                    all = false;
                }
                Some(sibling) => {
                    if !sibling.is_loaded() {
                        all = false;
                    }
                }
            }
            if !all {
                break;
            }
        }
        all
    };
    if !all_siblings_loaded {
        return;
    }

    // Hide the parent, show all 8 siblings in the same step.
    {
        let mut parent_map = lods[parent_lod_index as usize].mesh_map.write().unwrap();
        if let Some(parent_block) = parent_map.get_mut(&parent_bpos) {
            parent_block.active = false;
        }
    }
    lods[parent_lod_index as usize]
        .mesh_blocks_to_deactivate
        .push(parent_bpos);

    {
        let mut map = lods[lod_index as usize].mesh_map.write().unwrap();
        for sibling_index in 0..8 {
            let sibling_bpos = child_position(parent_bpos, sibling_index);
            if let Some(sibling) = map.get_mut(&sibling_bpos) {
                sibling.active = true;
            }
        }
    }
    for sibling_index in 0..8 {
        lods[lod_index as usize]
            .mesh_blocks_to_activate
            .push(child_position(parent_bpos, sibling_index));
    }

    // Each sibling may itself subdivide further.
    if lod_index > 0 {
        for sibling_index in 0..8 {
            let sibling_bpos = child_position(parent_bpos, sibling_index);
            for child_index in 0..8 {
                update_mesh_block_load(
                    lods,
                    child_position(sibling_bpos, child_index),
                    lod_index - 1,
                    lod_count,
                );
            }
        }
    }
}

/// Drain the loaded-mesh inbox, run activation for each entry, then refresh
/// transition masks on every LOD that changed (unless disabled, e.g. on a
/// server that never renders).
pub fn process_loaded_mesh_blocks_trigger_visibility_changes(
    state: &mut StreamingState,
    enable_transition_updates: bool,
) {
    let loaded_blocks: Vec<BlockLocation> = {
        let mut inbox = state.loaded_mesh_blocks.lock().unwrap();
        std::mem::take(&mut *inbox)
    };
    if loaded_blocks.is_empty() {
        return;
    }

    let lod_count = state.lod_count();
    for bloc in &loaded_blocks {
        update_mesh_block_load(&mut state.lods, bloc.position, bloc.lod_index as u32, lod_count);
    }

    if enable_transition_updates {
        let mut lods_to_update_transitions: u32 = 0;
        for bloc in &loaded_blocks {
            lods_to_update_transitions |= 0b111 << bloc.lod_index;
        }
        update_transition_masks(&mut state.lods, lods_to_update_transitions, lod_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MeshBlockState;
    use std::sync::Arc;
    use strata_voxel::VoxelBuffer;

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            lod_count: 2,
            data_block_size_po2: 4,
            mesh_block_size_po2: 4,
            ..Default::default()
        }
    }

    fn test_grid(config: &StreamingConfig) -> VoxelDataGrid {
        let bounds = Box3i::new(IVec3::splat(-2048), IVec3::splat(4096));
        VoxelDataGrid::new(bounds, config.data_block_size_po2, config.lod_count, true)
    }

    fn fill_data_area(grid: &mut VoxelDataGrid, area: Box3i, lod: u32) {
        area.for_each_cell(|pos| {
            grid.insert_loaded_block(pos, lod, Arc::new(VoxelBuffer::new(16, 0)), 1);
        });
    }

    fn insert_mesh_block(state: &StreamingState, lod: usize, pos: IVec3, loaded: bool) {
        let mut map = state.lods[lod].mesh_map.write().unwrap();
        let mb = MeshBlockState::new();
        if loaded {
            mb.mark_loaded();
        }
        map.insert(pos, mb);
    }

    /// One loaded data block whose whole neighborhood is resident triggers
    /// exactly one meshing push for the covering mesh block.
    #[test]
    fn test_data_load_completion_triggers_meshing() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);

        // Mesh block at origin wants an update.
        insert_mesh_block(&state, 0, IVec3::ZERO, false);

        // All 27 data blocks around the mesh block are resident.
        fill_data_area(&mut grid, Box3i::new(IVec3::splat(-1), IVec3::splat(3)), 0);

        state
            .loaded_data_blocks
            .lock()
            .unwrap()
            .push(BlockLocation { position: IVec3::ZERO, lod_index: 0 });

        process_loaded_data_blocks_trigger_meshing(&mut state, &grid, &config);

        assert_eq!(state.lods[0].mesh_blocks_pending_update, vec![IVec3::ZERO]);
        let map = state.lods[0].mesh_map.read().unwrap();
        assert_eq!(map[&IVec3::ZERO].state, MeshState::UpdateNotSent);
    }

    /// Missing neighbor data defers meshing.
    #[test]
    fn test_incomplete_neighborhood_defers_meshing() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);

        insert_mesh_block(&state, 0, IVec3::ZERO, false);
        // One corner of the neighborhood is missing.
        let area = Box3i::new(IVec3::splat(-1), IVec3::splat(3));
        area.for_each_cell(|pos| {
            if pos != IVec3::splat(-1) {
                grid.insert_loaded_block(pos, 0, Arc::new(VoxelBuffer::new(16, 0)), 1);
            }
        });

        state
            .loaded_data_blocks
            .lock()
            .unwrap()
            .push(BlockLocation { position: IVec3::ZERO, lod_index: 0 });

        process_loaded_data_blocks_trigger_meshing(&mut state, &grid, &config);

        assert!(state.lods[0].mesh_blocks_pending_update.is_empty());
        let map = state.lods[0].mesh_map.read().unwrap();
        assert_eq!(map[&IVec3::ZERO].state, MeshState::NeverUpdated);
    }

    /// A mesh block already updating is not queued again.
    #[test]
    fn test_update_already_sent_not_requeued() {
        let config = test_config();
        let mut grid = test_grid(&config);
        let mut state = StreamingState::new(config.lod_count);

        {
            let mut map = state.lods[0].mesh_map.write().unwrap();
            let mut mb = MeshBlockState::new();
            mb.state = MeshState::UpdateSent;
            map.insert(IVec3::ZERO, mb);
        }
        fill_data_area(&mut grid, Box3i::new(IVec3::splat(-1), IVec3::splat(3)), 0);

        state
            .loaded_data_blocks
            .lock()
            .unwrap()
            .push(BlockLocation { position: IVec3::ZERO, lod_index: 0 });

        process_loaded_data_blocks_trigger_meshing(&mut state, &grid, &config);
        assert!(state.lods[0].mesh_blocks_pending_update.is_empty());
    }

    /// Root LOD blocks activate as soon as they are loaded.
    #[test]
    fn test_root_lod_activates_on_load() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);
        insert_mesh_block(&state, 1, IVec3::ZERO, true);

        update_mesh_block_load(&mut state.lods, IVec3::ZERO, 1, config.lod_count);

        assert!(state.lods[1].mesh_map.read().unwrap()[&IVec3::ZERO].active);
        assert_eq!(state.lods[1].mesh_blocks_to_activate, vec![IVec3::ZERO]);
    }

    /// All 8 siblings finishing while the parent is active swaps the parent
    /// for the children in one step.
    #[test]
    fn test_full_sibling_set_replaces_parent() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);

        // Active parent at the root LOD.
        insert_mesh_block(&state, 1, IVec3::ZERO, true);
        state.lods[1].mesh_map.write().unwrap().get_mut(&IVec3::ZERO).unwrap().active = true;

        // 8 loaded children.
        for i in 0..8 {
            insert_mesh_block(&state, 0, child_position(IVec3::ZERO, i), true);
        }

        update_mesh_block_load(&mut state.lods, IVec3::ZERO, 0, config.lod_count);

        assert!(!state.lods[1].mesh_map.read().unwrap()[&IVec3::ZERO].active);
        assert_eq!(state.lods[1].mesh_blocks_to_deactivate, vec![IVec3::ZERO]);
        let child_map = state.lods[0].mesh_map.read().unwrap();
        for i in 0..8 {
            assert!(child_map[&child_position(IVec3::ZERO, i)].active);
        }
        assert_eq!(state.lods[0].mesh_blocks_to_activate.len(), 8);
    }

    /// With one sibling still building, the parent stays visible.
    #[test]
    fn test_partial_sibling_set_keeps_parent_active() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);

        insert_mesh_block(&state, 1, IVec3::ZERO, true);
        state.lods[1].mesh_map.write().unwrap().get_mut(&IVec3::ZERO).unwrap().active = true;

        for i in 0..7 {
            insert_mesh_block(&state, 0, child_position(IVec3::ZERO, i), true);
        }
        insert_mesh_block(&state, 0, child_position(IVec3::ZERO, 7), false);

        update_mesh_block_load(&mut state.lods, IVec3::ZERO, 0, config.lod_count);

        assert!(state.lods[1].mesh_map.read().unwrap()[&IVec3::ZERO].active);
        assert!(!state.lods[0].mesh_map.read().unwrap()[&IVec3::ZERO].active);
        assert!(state.lods[0].mesh_blocks_to_activate.is_empty());
    }

    /// A missing sibling is tolerated as "not all loaded".
    #[test]
    fn test_missing_sibling_treated_as_not_loaded() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);

        insert_mesh_block(&state, 1, IVec3::ZERO, true);
        state.lods[1].mesh_map.write().unwrap().get_mut(&IVec3::ZERO).unwrap().active = true;

        // Only 7 of 8 siblings exist at all.
        for i in 0..7 {
            insert_mesh_block(&state, 0, child_position(IVec3::ZERO, i), true);
        }

        update_mesh_block_load(&mut state.lods, IVec3::ZERO, 0, config.lod_count);
        assert!(state.lods[1].mesh_map.read().unwrap()[&IVec3::ZERO].active);
    }

    /// Draining the mesh inbox drives activation end to end.
    #[test]
    fn test_inbox_drain_activates_completed_meshes() {
        let config = test_config();
        let mut state = StreamingState::new(config.lod_count);
        insert_mesh_block(&state, 1, IVec3::new(2, 0, -1), true);

        state
            .loaded_mesh_blocks
            .lock()
            .unwrap()
            .push(BlockLocation { position: IVec3::new(2, 0, -1), lod_index: 1 });

        process_loaded_mesh_blocks_trigger_visibility_changes(&mut state, false);

        assert!(state.lods[1].mesh_map.read().unwrap()[&IVec3::new(2, 0, -1)].active);
        assert!(state.loaded_mesh_blocks.lock().unwrap().is_empty());
    }
}
