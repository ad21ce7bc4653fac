//! Background work: the task variants and the worker pool that runs them.
//!
//! Voxel loads and mesh builds run on CPU workers; GPU detail-normalmap
//! submissions run on a dedicated worker owning the compute device, and
//! chain into a CPU pass that assembles the virtual texture. Workers never
//! touch streaming state directly: mesh completions go through the
//! [`MeshCompletionSink`] contract, everything else returns through the
//! result channel for the update task to apply.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use glam::IVec3;
use tracing::{error, warn};

use strata_gpu::{ComputeDevice, DetailNormalmapTask, VirtualTextureArtifact, VirtualTexturePass2Task};
use strata_voxel::VoxelBuffer;

use crate::state::MeshCompletionSink;

/// Loads voxel payloads from generation or persistence. Implementations may
/// block; they are called from worker threads only.
pub trait VoxelLoader: Send + Sync {
    /// Load or generate the block at `(position, lod)`. `None` means the
    /// load failed; the block stays missing until its box moves again.
    fn load_block(&self, position: IVec3, lod_index: u8) -> Option<VoxelBuffer>;
}

/// Polygonizes one mesh block from a voxel snapshot padded by one chunk.
pub trait MeshBuilder: Send + Sync {
    fn build_mesh(&self, position: IVec3, lod_index: u8) -> MeshPayload;
}

/// Geometry produced by a mesh build, consumed by the renderer and by
/// detail-normalmap tasks.
#[derive(Debug, Default)]
pub struct MeshPayload {
    pub vertices: Vec<[f32; 4]>,
    pub indices: Vec<i32>,
}

/// A unit of background work.
pub enum StreamingTask {
    LoadData { position: IVec3, lod_index: u8 },
    BuildMesh { position: IVec3, lod_index: u8 },
    GpuDetailNormalmap(Box<DetailNormalmapTask>),
    RenderVirtualTexturePass2(Box<VirtualTexturePass2Task>),
}

/// A completed unit of background work, drained by the update task.
pub enum TaskResult {
    DataLoaded {
        position: IVec3,
        lod_index: u8,
        voxels: Option<Arc<VoxelBuffer>>,
    },
    MeshBuilt {
        position: IVec3,
        lod_index: u8,
        mesh: MeshPayload,
    },
    VirtualTextureReady {
        block_position: IVec3,
        lod_index: u8,
        artifact: VirtualTextureArtifact,
    },
}

/// Worker pool for streaming tasks.
///
/// CPU workers share one task channel; an optional GPU worker owns the
/// compute device and its own channel. An in-flight budget bounds the
/// memory held by queued snapshots.
pub struct TaskPool {
    cpu_sender: Option<crossbeam_channel::Sender<StreamingTask>>,
    gpu_sender: Option<crossbeam_channel::Sender<StreamingTask>>,
    result_receiver: crossbeam_channel::Receiver<TaskResult>,
    worker_handles: Vec<JoinHandle<()>>,
    budget: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TaskPool {
    /// Spawn `worker_count` CPU workers, plus a GPU worker when a device is
    /// provided.
    pub fn new(
        worker_count: usize,
        budget: usize,
        loader: Arc<dyn VoxelLoader>,
        builder: Arc<dyn MeshBuilder>,
        mesh_completions: MeshCompletionSink,
        gpu_device: Option<Box<dyn ComputeDevice>>,
    ) -> Self {
        let (cpu_tx, cpu_rx) = crossbeam_channel::bounded::<StreamingTask>(budget);
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<TaskResult>();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_index in 0..worker_count {
            let rx = cpu_rx.clone();
            let tx = result_tx.clone();
            let loader = Arc::clone(&loader);
            let builder = Arc::clone(&builder);
            let completions = mesh_completions.clone();
            let flight = Arc::clone(&in_flight);

            handles.push(
                std::thread::Builder::new()
                    .name(format!("strata-worker-{worker_index}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            run_cpu_task(task, &*loader, &*builder, &completions, &tx);
                            flight.fetch_sub(1, Ordering::Relaxed);
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }

        let gpu_sender = gpu_device.map(|mut device| {
            let (gpu_tx, gpu_rx) = crossbeam_channel::bounded::<StreamingTask>(budget);
            let cpu_tx = cpu_tx.clone();
            let flight = Arc::clone(&in_flight);

            handles.push(
                std::thread::Builder::new()
                    .name("strata-gpu-worker".into())
                    .spawn(move || {
                        while let Ok(task) = gpu_rx.recv() {
                            run_gpu_task(task, device.as_mut(), &cpu_tx, &flight);
                            flight.fetch_sub(1, Ordering::Relaxed);
                        }
                    })
                    .expect("failed to spawn GPU worker thread"),
            );
            gpu_tx
        });

        Self {
            cpu_sender: Some(cpu_tx),
            gpu_sender,
            result_receiver: result_rx,
            worker_handles: handles,
            budget,
            in_flight,
        }
    }

    /// Submit a task. Returns `false` when the budget is exhausted, the
    /// pool is shut down, or a GPU task is submitted without a GPU worker.
    pub fn submit(&self, task: StreamingTask) -> bool {
        let sender = match &task {
            StreamingTask::GpuDetailNormalmap(_) => match &self.gpu_sender {
                Some(sender) => sender,
                None => {
                    warn!("GPU task submitted to a pool without a GPU worker");
                    return false;
                }
            },
            _ => match &self.cpu_sender {
                Some(sender) => sender,
                None => return false,
            },
        };

        if self.in_flight.load(Ordering::Relaxed) >= self.budget {
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        if sender.send(task).is_err() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Drain completed results. Called once per tick by the update task.
    pub fn drain_results(&self) -> Vec<TaskResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_receiver.try_recv() {
            results.push(result);
        }
        results
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Drop the task channels and join every worker.
    pub fn shutdown(&mut self) {
        self.cpu_sender.take();
        self.gpu_sender.take();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_cpu_task(
    task: StreamingTask,
    loader: &dyn VoxelLoader,
    builder: &dyn MeshBuilder,
    completions: &MeshCompletionSink,
    results: &crossbeam_channel::Sender<TaskResult>,
) {
    match task {
        StreamingTask::LoadData { position, lod_index } => {
            let voxels = loader.load_block(position, lod_index).map(Arc::new);
            let _ = results.send(TaskResult::DataLoaded { position, lod_index, voxels });
        }
        StreamingTask::BuildMesh { position, lod_index } => {
            let mesh = builder.build_mesh(position, lod_index);
            // Completion contract: flip `loaded` under the map's read lock,
            // then post into the activation inbox.
            completions.mark_built(position, lod_index);
            let _ = results.send(TaskResult::MeshBuilt { position, lod_index, mesh });
        }
        StreamingTask::RenderVirtualTexturePass2(pass2) => {
            let block_position = pass2.block_position;
            let lod_index = pass2.lod_index;
            let artifact = pass2.run();
            let _ = results.send(TaskResult::VirtualTextureReady {
                block_position,
                lod_index,
                artifact,
            });
        }
        StreamingTask::GpuDetailNormalmap(_) => {
            error!("GPU task routed to a CPU worker, dropping");
        }
    }
}

fn run_gpu_task(
    task: StreamingTask,
    device: &mut dyn ComputeDevice,
    cpu_tasks: &crossbeam_channel::Sender<StreamingTask>,
    in_flight: &AtomicUsize,
) {
    match task {
        StreamingTask::GpuDetailNormalmap(gpu_task) => {
            let block_position = gpu_task.input.block_position;
            match gpu_task.run(device) {
                Ok(pass2) => {
                    // The follow-up assembly is CPU work; chain it through
                    // the normal channel.
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    if cpu_tasks
                        .send(StreamingTask::RenderVirtualTexturePass2(Box::new(pass2)))
                        .is_err()
                    {
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                Err(err) => {
                    // The task released its resources; the block keeps its
                    // previous detail map and can retry on a later tick.
                    warn!(?block_position, "detail normalmap task aborted: {err}");
                }
            }
        }
        _ => {
            error!("non-GPU task routed to the GPU worker, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MeshBlockState, StreamingState};
    use std::time::{Duration, Instant};

    struct TestLoader;
    impl VoxelLoader for TestLoader {
        fn load_block(&self, position: IVec3, _lod_index: u8) -> Option<VoxelBuffer> {
            if position.x < 0 {
                // Simulated stream failure.
                return None;
            }
            Some(VoxelBuffer::new(16, position.x as u16))
        }
    }

    struct TestBuilder;
    impl MeshBuilder for TestBuilder {
        fn build_mesh(&self, _position: IVec3, _lod_index: u8) -> MeshPayload {
            MeshPayload {
                vertices: vec![[0.0; 4]; 3],
                indices: vec![0, 1, 2],
            }
        }
    }

    fn pool_with_state(workers: usize, budget: usize) -> (TaskPool, StreamingState) {
        let state = StreamingState::new(2);
        let pool = TaskPool::new(
            workers,
            budget,
            Arc::new(TestLoader),
            Arc::new(TestBuilder),
            state.mesh_completion_sink(),
            None,
        );
        (pool, state)
    }

    fn wait_for_results(pool: &TaskPool, count: usize) -> Vec<TaskResult> {
        let start = Instant::now();
        let mut results = Vec::new();
        while results.len() < count {
            results.extend(pool.drain_results());
            assert!(start.elapsed().as_secs() < 5, "timed out waiting for results");
            std::thread::sleep(Duration::from_millis(1));
        }
        results
    }

    #[test]
    fn test_load_task_returns_voxels() {
        let (pool, _state) = pool_with_state(2, 8);
        assert!(pool.submit(StreamingTask::LoadData {
            position: IVec3::new(3, 0, 0),
            lod_index: 1,
        }));

        let results = wait_for_results(&pool, 1);
        match &results[0] {
            TaskResult::DataLoaded { position, lod_index, voxels } => {
                assert_eq!(*position, IVec3::new(3, 0, 0));
                assert_eq!(*lod_index, 1);
                assert_eq!(voxels.as_ref().unwrap().get(0, 0, 0), 3);
            }
            _ => panic!("expected DataLoaded"),
        }
    }

    #[test]
    fn test_failed_load_reports_none() {
        let (pool, _state) = pool_with_state(1, 4);
        pool.submit(StreamingTask::LoadData {
            position: IVec3::new(-1, 0, 0),
            lod_index: 0,
        });
        let results = wait_for_results(&pool, 1);
        match &results[0] {
            TaskResult::DataLoaded { voxels, .. } => assert!(voxels.is_none()),
            _ => panic!("expected DataLoaded"),
        }
    }

    /// A mesh build flips `loaded` through the completion sink and posts
    /// into the activation inbox, in addition to returning the payload.
    #[test]
    fn test_mesh_build_runs_completion_contract() {
        let (pool, state) = pool_with_state(1, 4);
        let pos = IVec3::new(1, 2, 3);
        state.lods[0].mesh_map.write().unwrap().insert(pos, MeshBlockState::new());

        pool.submit(StreamingTask::BuildMesh { position: pos, lod_index: 0 });
        let results = wait_for_results(&pool, 1);

        assert!(matches!(results[0], TaskResult::MeshBuilt { .. }));
        assert!(state.lods[0].mesh_map.read().unwrap()[&pos].is_loaded());
        assert_eq!(state.loaded_mesh_blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_budget_limits_submissions() {
        let (pool, _state) = pool_with_state(1, 2);
        let mut accepted = 0;
        for i in 0..10 {
            if pool.submit(StreamingTask::LoadData {
                position: IVec3::new(i, 0, 0),
                lod_index: 0,
            }) {
                accepted += 1;
            }
        }
        assert!(accepted <= 4, "budget should bound submissions, got {accepted}");
    }

    #[test]
    fn test_gpu_task_rejected_without_gpu_worker() {
        use strata_gpu::{
            DetailNormalmapInput, DetailNormalmapParams, DetailShaders, SdfOperation, ShaderHandle,
        };

        let (pool, _state) = pool_with_state(1, 4);
        let input = DetailNormalmapInput {
            mesh_vertices: Vec::new(),
            mesh_indices: Vec::new(),
            cell_triangles: Vec::new(),
            tile_data: Vec::new(),
            params: DetailNormalmapParams {
                block_origin_world: glam::Vec3::ZERO,
                pixel_world_step: 1.0,
                tile_size_pixels: 16,
                tiles_x: 1,
                max_deviation_cosine: 1.0,
                max_deviation_sine: 0.0,
            },
            texture_width: 16,
            texture_height: 16,
            shaders: DetailShaders {
                gather_hits: ShaderHandle::NULL,
                modifier: ShaderHandle::NULL,
                normalmap: ShaderHandle::NULL,
                dilate: ShaderHandle::NULL,
            },
            modifier_operation: SdfOperation::Replace,
            modifier_textures: Vec::new(),
            block_position: IVec3::ZERO,
            block_size: 16,
            lod_index: 0,
        };
        let task = DetailNormalmapTask::new(input);
        assert!(!pool.submit(StreamingTask::GpuDetailNormalmap(Box::new(task))));
    }

    #[test]
    fn test_pass2_task_runs_on_cpu_workers() {
        let (pool, _state) = pool_with_state(1, 4);
        let pass2 = VirtualTexturePass2Task {
            atlas_data: vec![0; 16 * 16 * 4],
            tiles: Vec::new(),
            atlas_width: 16,
            atlas_height: 16,
            tile_size_pixels: 16,
            block_position: IVec3::ZERO,
            block_size: 16,
            lod_index: 0,
        };
        // The CPU half of the GPU pipeline still runs.
        assert!(pool.submit(StreamingTask::RenderVirtualTexturePass2(Box::new(pass2))));
        let results = wait_for_results(&pool, 1);
        match &results[0] {
            TaskResult::VirtualTextureReady { artifact, .. } => {
                assert_eq!(artifact.atlas.len(), 16 * 16 * 4);
            }
            _ => panic!("expected VirtualTextureReady"),
        }
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let (mut pool, _state) = pool_with_state(3, 8);
        pool.submit(StreamingTask::LoadData { position: IVec3::ZERO, lod_index: 0 });
        pool.shutdown();
        assert!(!pool.submit(StreamingTask::LoadData { position: IVec3::ZERO, lod_index: 0 }));
    }
}
