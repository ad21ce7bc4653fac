//! Shared streaming state: per-LOD mesh maps, pending loads, paired viewers
//! and the completion inboxes workers post into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use glam::IVec3;
use rustc_hash::FxHashMap;

use strata_math::Box3i;
use strata_voxel::RefCount;

use crate::viewer::ViewerId;

/// Lifecycle of one mesh chunk's polygonization request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshState {
    /// Never polygonized; waiting for its data dependencies.
    NeverUpdated,
    /// Data changed (or a request was cancelled); needs scheduling again.
    NeedUpdate,
    /// Queued in `mesh_blocks_pending_update`, not yet handed to a worker.
    UpdateNotSent,
    /// A build task is in flight.
    UpdateSent,
}

/// One mesh chunk in a per-LOD mesh map.
///
/// Structural changes (insert/erase) and plain field updates happen on the
/// update task under the map's write lock. Mesh builders flip `loaded` from
/// worker threads while holding only the read lock, which is why it is an
/// atomic rather than a plain bool.
#[derive(Debug)]
pub struct MeshBlockState {
    pub state: MeshState,
    /// Whether this chunk is currently part of the rendered LOD cut.
    pub active: bool,
    loaded: AtomicBool,
    pub mesh_viewers: RefCount,
    pub collision_viewers: RefCount,
    /// 6-bit LOD-seam mask, one bit per face abutting a coarser LOD.
    pub transition_mask: u8,
}

impl MeshBlockState {
    pub fn new() -> Self {
        Self {
            state: MeshState::NeverUpdated,
            active: false,
            loaded: AtomicBool::new(false),
            mesh_viewers: RefCount::default(),
            collision_viewers: RefCount::default(),
            transition_mask: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Called by mesh builders on completion, under the map's read lock.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }
}

impl Default for MeshBlockState {
    fn default() -> Self {
        Self::new()
    }
}

pub type MeshMap = FxHashMap<IVec3, MeshBlockState>;

/// A `(position, lod)` pair, the unit of all load/build bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    pub position: IVec3,
    pub lod_index: u8,
}

/// A data block with a load in flight: counts the viewers waiting on it so
/// the load can be cancelled when the last one moves away.
#[derive(Debug, Default)]
pub struct LoadingDataBlock {
    pub viewers: RefCount,
}

/// Per-LOD streaming state. Only the update task mutates `loading_blocks`
/// and the queues; the mesh map is shared with workers behind its lock.
pub struct LodState {
    pub mesh_map: Arc<RwLock<MeshMap>>,
    pub loading_blocks: FxHashMap<IVec3, LoadingDataBlock>,
    /// Mesh chunks whose data dependencies are resident, awaiting dispatch.
    pub mesh_blocks_pending_update: Vec<IVec3>,
    /// Visibility deltas for the renderer, produced by the activation engine.
    pub mesh_blocks_to_activate: Vec<IVec3>,
    pub mesh_blocks_to_deactivate: Vec<IVec3>,
    pub mesh_blocks_to_unload: Vec<IVec3>,
    /// Chunks whose transition mask changed since the last drain.
    pub mesh_blocks_with_changed_transitions: Vec<IVec3>,
}

impl LodState {
    fn new() -> Self {
        Self {
            mesh_map: Arc::new(RwLock::new(MeshMap::default())),
            loading_blocks: FxHashMap::default(),
            mesh_blocks_pending_update: Vec::new(),
            mesh_blocks_to_activate: Vec::new(),
            mesh_blocks_to_deactivate: Vec::new(),
            mesh_blocks_to_unload: Vec::new(),
            mesh_blocks_with_changed_transitions: Vec::new(),
        }
    }
}

/// Everything the clipbox planner derives for one viewer on one tick.
#[derive(Clone, Debug, Default)]
pub struct ViewerBoxState {
    pub view_distance_voxels: i32,
    pub local_position_voxels: IVec3,
    pub requires_collisions: bool,
    pub requires_meshes: bool,
    /// Resident data region per LOD, in data-chunk coordinates of that LOD.
    pub data_box_per_lod: Vec<Box3i>,
    /// Resident mesh region per LOD, in mesh-chunk coordinates of that LOD.
    pub mesh_box_per_lod: Vec<Box3i>,
}

impl ViewerBoxState {
    pub fn new(lod_count: u32) -> Self {
        Self {
            data_box_per_lod: vec![Box3i::ZERO; lod_count as usize],
            mesh_box_per_lod: vec![Box3i::ZERO; lod_count as usize],
            ..Default::default()
        }
    }
}

/// A viewer the streaming state has paired with: its current boxes and the
/// previous tick's boxes, which is what the differ diffs.
pub struct PairedViewer {
    pub id: ViewerId,
    pub state: ViewerBoxState,
    pub prev_state: ViewerBoxState,
}

impl PairedViewer {
    pub fn new(id: ViewerId, lod_count: u32) -> Self {
        Self {
            id,
            state: ViewerBoxState::new(lod_count),
            prev_state: ViewerBoxState::new(lod_count),
        }
    }
}

/// The streaming state owned by the update task.
pub struct StreamingState {
    pub lods: Vec<LodState>,
    pub paired_viewers: Vec<PairedViewer>,
    /// Inbox filled by data loaders: blocks whose voxels arrived since the
    /// last tick. Drained by the meshing-trigger step.
    pub loaded_data_blocks: Arc<Mutex<Vec<BlockLocation>>>,
    /// Inbox filled by mesh builders: blocks whose mesh arrived since the
    /// last tick. Drained by the activation step.
    pub loaded_mesh_blocks: Arc<Mutex<Vec<BlockLocation>>>,
}

impl StreamingState {
    pub fn new(lod_count: u32) -> Self {
        Self {
            lods: (0..lod_count).map(|_| LodState::new()).collect(),
            paired_viewers: Vec::new(),
            loaded_data_blocks: Arc::new(Mutex::new(Vec::new())),
            loaded_mesh_blocks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn lod_count(&self) -> u32 {
        self.lods.len() as u32
    }

    /// Shared handles a mesh builder needs to report completions: the
    /// per-LOD maps and the activation inbox.
    pub fn mesh_completion_sink(&self) -> MeshCompletionSink {
        MeshCompletionSink {
            mesh_maps: self.lods.iter().map(|lod| lod.mesh_map.clone()).collect(),
            loaded_mesh_blocks: self.loaded_mesh_blocks.clone(),
        }
    }

    /// Shared handle data loaders use to report completions.
    pub fn data_completion_inbox(&self) -> Arc<Mutex<Vec<BlockLocation>>> {
        self.loaded_data_blocks.clone()
    }
}

/// Cloneable bundle of handles for mesh-build workers: flip `loaded` under
/// the read lock, then post the location into the activation inbox.
#[derive(Clone)]
pub struct MeshCompletionSink {
    mesh_maps: Vec<Arc<RwLock<MeshMap>>>,
    loaded_mesh_blocks: Arc<Mutex<Vec<BlockLocation>>>,
}

impl MeshCompletionSink {
    pub fn mark_built(&self, position: IVec3, lod_index: u8) {
        if let Some(map) = self.mesh_maps.get(lod_index as usize) {
            let map = map.read().unwrap();
            if let Some(block) = map.get(&position) {
                block.mark_loaded();
            }
        }
        self.loaded_mesh_blocks
            .lock()
            .unwrap()
            .push(BlockLocation { position, lod_index });
    }
}
