//! Per-mesh-block detail normal maps: a single submission that renders a
//! tiled normal-map atlas from a coarse mesh and a signed-distance field.
//!
//! Five stages joined by barriers: gather ray hits per pixel, evaluate the
//! SDF modifier at the hit positions, render normals into the atlas, then
//! dilate twice so tile borders survive mipmapping. The atlas is downloaded
//! and handed to a follow-up pass that assembles the virtual-texture
//! artifact on the CPU.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};
use tracing::debug;

use crate::device::{
    BufferHandle, ComputeDevice, DeviceError, PipelineHandle, ShaderHandle, TextureHandle,
    UniformBinding, UniformResource,
};

/// Errors that abort a normal-map task before or during submission.
#[derive(Debug, thiserror::Error)]
pub enum GpuTaskError {
    /// A required compute shader handle is null.
    #[error("missing or invalid compute shader: {0}")]
    InvalidShader(&'static str),

    /// A required task input is empty.
    #[error("empty task input: {0}")]
    EmptyInput(&'static str),

    /// The device failed to allocate or submit; partially allocated
    /// resources have been released and the task can be retried later.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// `collect` was called without a successful `prepare`.
    #[error("task was collected before being prepared")]
    NotPrepared,
}

/// Workgroup edge for the tile-space stages (gather, modifier, normalmap).
const TILE_LOCAL_GROUP_SIZE: u32 = 4;
/// Workgroup edge for the image-space dilation passes.
const DILATION_LOCAL_GROUP_SIZE: u32 = 8;

/// One atlas tile: the cell of the mesh block it samples, with the
/// projection axis packed in the low 2 bits of `data`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TileData {
    pub cell_x: u8,
    pub cell_y: u8,
    pub cell_z: u8,
    pub data: u8,
}

/// A tile descriptor in the finished artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalmapTile {
    pub cell: IVec3,
    pub axis: u8,
}

/// How the SDF modifier combines with the base distance field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdfOperation {
    Union = 0,
    Subtract = 1,
    Replace = 2,
}

/// Injected capability bundle: the compute shaders every normal-map task
/// needs. Obtained once from the engine, never from global state.
#[derive(Clone, Copy, Debug)]
pub struct DetailShaders {
    pub gather_hits: ShaderHandle,
    pub modifier: ShaderHandle,
    pub normalmap: ShaderHandle,
    pub dilate: ShaderHandle,
}

/// An extra texture the modifier shader samples, with its binding index.
#[derive(Clone, Copy, Debug)]
pub struct ModifierTextureParam {
    pub binding: u32,
    pub texture: TextureHandle,
}

/// Scalar parameters shared by the tile-space stages.
#[derive(Clone, Copy, Debug)]
pub struct DetailNormalmapParams {
    pub block_origin_world: Vec3,
    pub pixel_world_step: f32,
    pub tile_size_pixels: i32,
    pub tiles_x: i32,
    pub max_deviation_cosine: f32,
    pub max_deviation_sine: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GatherHitsParams {
    block_origin_world: [f32; 3],
    pixel_world_step: f32,
    tile_size_pixels: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ModifierParams {
    tile_size_pixels: i32,
    pixel_world_step: f32,
    operation: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NormalmapStageParams {
    tile_size_pixels: i32,
    tiles_x: i32,
    max_deviation_cosine: f32,
    max_deviation_sine: f32,
}

// Uniform buffers are at least 16 bytes on most backends, so the single
// i32 rides with explicit padding.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DilationParams {
    tile_size_pixels: i32,
    _pad: [i32; 3],
}

/// Everything the task allocated on the device, for cleanup.
#[derive(Default)]
struct TaskResources {
    texture0: TextureHandle,
    texture1: TextureHandle,
    gather_pipeline: PipelineHandle,
    modifier_pipeline: PipelineHandle,
    normalmap_pipeline: PipelineHandle,
    dilation_pipeline: PipelineHandle,
    buffers: Vec<BufferHandle>,
}

impl TaskResources {
    /// Free every allocated resource. Uniform sets release themselves once
    /// their contents are freed.
    fn release(&mut self, device: &mut dyn ComputeDevice) {
        for texture in [self.texture0, self.texture1] {
            if !texture.is_null() {
                device.free_texture(texture);
            }
        }
        for pipeline in [
            self.gather_pipeline,
            self.modifier_pipeline,
            self.normalmap_pipeline,
            self.dilation_pipeline,
        ] {
            if !pipeline.is_null() {
                device.free_pipeline(pipeline);
            }
        }
        for buffer in self.buffers.drain(..) {
            device.free_buffer(buffer);
        }
    }
}

/// Inputs for one mesh block's normal-map atlas. All byte blobs are owned;
/// the task holds no locks and no references into engine state.
pub struct DetailNormalmapInput {
    /// Coarse mesh vertices, one vec4 per vertex.
    pub mesh_vertices: Vec<[f32; 4]>,
    pub mesh_indices: Vec<i32>,
    /// Per-cell triangle lists indexing into `mesh_indices`.
    pub cell_triangles: Vec<i32>,
    pub tile_data: Vec<TileData>,
    pub params: DetailNormalmapParams,
    pub texture_width: u32,
    pub texture_height: u32,
    pub shaders: DetailShaders,
    pub modifier_operation: SdfOperation,
    pub modifier_textures: Vec<ModifierTextureParam>,
    pub block_position: IVec3,
    pub block_size: i32,
    pub lod_index: u8,
}

/// The 5-stage GPU task. `prepare` allocates and submits, `collect`
/// downloads the atlas and frees everything.
pub struct DetailNormalmapTask {
    pub input: DetailNormalmapInput,
    resources: Option<TaskResources>,
}

impl DetailNormalmapTask {
    pub fn new(input: DetailNormalmapInput) -> Self {
        Self { input, resources: None }
    }

    fn validate(&self) -> Result<(), GpuTaskError> {
        let input = &self.input;
        if input.shaders.gather_hits.is_null() {
            return Err(GpuTaskError::InvalidShader("gather_hits"));
        }
        if input.shaders.modifier.is_null() {
            return Err(GpuTaskError::InvalidShader("modifier"));
        }
        if input.shaders.normalmap.is_null() {
            return Err(GpuTaskError::InvalidShader("normalmap"));
        }
        if input.shaders.dilate.is_null() {
            return Err(GpuTaskError::InvalidShader("dilate"));
        }
        if input.mesh_vertices.is_empty() {
            return Err(GpuTaskError::EmptyInput("mesh_vertices"));
        }
        if input.mesh_indices.is_empty() {
            return Err(GpuTaskError::EmptyInput("mesh_indices"));
        }
        if input.cell_triangles.is_empty() {
            return Err(GpuTaskError::EmptyInput("cell_triangles"));
        }
        if input.tile_data.is_empty() {
            return Err(GpuTaskError::EmptyInput("tile_data"));
        }
        Ok(())
    }

    /// Allocate resources, record the 5-stage compute list and submit it.
    ///
    /// On any failure all partial allocations are released and the task is
    /// left unprepared; the mesh block keeps its previous detail map and
    /// the task can be retried on a later tick.
    pub fn prepare(&mut self, device: &mut dyn ComputeDevice) -> Result<(), GpuTaskError> {
        self.validate()?;

        let mut resources = TaskResources::default();
        match self.prepare_inner(device, &mut resources) {
            Ok(()) => {
                self.resources = Some(resources);
                Ok(())
            }
            Err(err) => {
                debug!("normal-map task aborted, releasing partial allocations");
                resources.release(device);
                Err(err)
            }
        }
    }

    fn prepare_inner(
        &self,
        device: &mut dyn ComputeDevice,
        res: &mut TaskResources,
    ) -> Result<(), GpuTaskError> {
        let input = &self.input;
        let n_tiles = input.tile_data.len() as u32;
        let tile_size = input.params.tile_size_pixels as u32;

        // Output image and its dilation ping-pong partner. Sizes vary per
        // block, so these can't be pooled trivially.
        res.texture0 =
            device.texture_2d_create(input.texture_width, input.texture_height, "normalmap-0")?;
        res.texture1 =
            device.texture_2d_create(input.texture_width, input.texture_height, "normalmap-1")?;

        // Mesh and tile inputs.
        let mesh_vertices = alloc_storage(
            device,
            res,
            bytemuck::cast_slice(&input.mesh_vertices),
            "mesh-vertices",
        )?;
        let mesh_indices = alloc_storage(
            device,
            res,
            bytemuck::cast_slice(&input.mesh_indices),
            "mesh-indices",
        )?;
        let cell_triangles = alloc_storage(
            device,
            res,
            bytemuck::cast_slice(&input.cell_triangles),
            "cell-triangles",
        )?;
        let tile_data = alloc_storage(device, res, bytemuck::cast_slice(&input.tile_data), "tiles")?;

        let gather_params = alloc_storage(
            device,
            res,
            bytemuck::bytes_of(&GatherHitsParams {
                block_origin_world: input.params.block_origin_world.to_array(),
                pixel_world_step: input.params.pixel_world_step,
                tile_size_pixels: input.params.tile_size_pixels,
            }),
            "gather-params",
        )?;

        // One vec4 hit position per atlas pixel.
        let hit_positions_size = n_tiles as u64 * (tile_size * tile_size) as u64 * 16;
        let hit_positions = device.storage_buffer_create(hit_positions_size, None, "hit-positions")?;
        res.buffers.push(hit_positions);

        let modifier_params = alloc_storage(
            device,
            res,
            bytemuck::bytes_of(&ModifierParams {
                tile_size_pixels: input.params.tile_size_pixels,
                pixel_world_step: input.params.pixel_world_step,
                operation: input.modifier_operation as i32,
            }),
            "modifier-params",
        )?;

        // Ping-pong signed-distance buffers, one vec4 per atlas pixel.
        let sd_size = n_tiles as u64 * (tile_size * tile_size) as u64 * 16;
        let sd_buffer0 = device.storage_buffer_create(sd_size, None, "sd-0")?;
        res.buffers.push(sd_buffer0);
        let sd_buffer1 = device.storage_buffer_create(sd_size, None, "sd-1")?;
        res.buffers.push(sd_buffer1);

        let normalmap_params = alloc_storage(
            device,
            res,
            bytemuck::bytes_of(&NormalmapStageParams {
                tile_size_pixels: input.params.tile_size_pixels,
                tiles_x: input.params.tiles_x,
                max_deviation_cosine: input.params.max_deviation_cosine,
                max_deviation_sine: input.params.max_deviation_sine,
            }),
            "normalmap-params",
        )?;

        let dilation_params = device.uniform_buffer_create(
            bytemuck::bytes_of(&DilationParams {
                tile_size_pixels: input.params.tile_size_pixels,
                _pad: [0; 3],
            }),
            "dilation-params",
        )?;
        res.buffers.push(dilation_params);

        res.gather_pipeline = device.compute_pipeline_create(input.shaders.gather_hits)?;
        res.modifier_pipeline = device.compute_pipeline_create(input.shaders.modifier)?;
        res.normalmap_pipeline = device.compute_pipeline_create(input.shaders.normalmap)?;
        res.dilation_pipeline = device.compute_pipeline_create(input.shaders.dilate)?;

        let tile_groups_x = tile_size.div_ceil(TILE_LOCAL_GROUP_SIZE);
        let tile_groups_y = tile_size.div_ceil(TILE_LOCAL_GROUP_SIZE);
        let tile_groups_z = n_tiles.div_ceil(TILE_LOCAL_GROUP_SIZE);
        let dilation_groups_x = input.texture_width.div_ceil(DILATION_LOCAL_GROUP_SIZE);
        let dilation_groups_y = input.texture_height.div_ceil(DILATION_LOCAL_GROUP_SIZE);

        let list = device.compute_list_begin();

        // Stage 1: gather hit positions per atlas pixel.
        {
            let set = device.uniform_set_create(
                &[
                    UniformBinding::new(0, UniformResource::StorageBuffer(mesh_vertices)),
                    UniformBinding::new(1, UniformResource::StorageBuffer(mesh_indices)),
                    UniformBinding::new(2, UniformResource::StorageBuffer(cell_triangles)),
                    UniformBinding::new(3, UniformResource::StorageBuffer(tile_data)),
                    UniformBinding::new(4, UniformResource::StorageBuffer(gather_params)),
                    UniformBinding::new(5, UniformResource::StorageBuffer(hit_positions)),
                ],
                res.gather_pipeline,
            )?;
            device.compute_list_bind_pipeline(list, res.gather_pipeline);
            device.compute_list_bind_uniform_set(list, set);
            device.compute_list_dispatch(list, tile_groups_x, tile_groups_y, tile_groups_z);
        }

        device.compute_list_add_barrier(list);

        // Stage 2: evaluate the SDF modifier at the hit positions.
        {
            let mut bindings = vec![
                UniformBinding::new(0, UniformResource::StorageBuffer(hit_positions)),
                UniformBinding::new(1, UniformResource::StorageBuffer(modifier_params)),
                UniformBinding::new(2, UniformResource::StorageBuffer(sd_buffer0)),
                UniformBinding::new(3, UniformResource::StorageBuffer(sd_buffer1)),
            ];
            let sampler = device.filtering_sampler();
            for texture_param in &input.modifier_textures {
                bindings.push(UniformBinding::new(
                    texture_param.binding,
                    UniformResource::SamplerWithTexture(sampler, texture_param.texture),
                ));
            }
            let set = device.uniform_set_create(&bindings, res.modifier_pipeline)?;
            device.compute_list_bind_pipeline(list, res.modifier_pipeline);
            device.compute_list_bind_uniform_set(list, set);
            device.compute_list_dispatch(list, tile_groups_x, tile_groups_y, tile_groups_z);
        }

        device.compute_list_add_barrier(list);

        // Stage 3: render normals into image 0.
        {
            let set = device.uniform_set_create(
                &[
                    UniformBinding::new(0, UniformResource::StorageBuffer(sd_buffer1)),
                    UniformBinding::new(1, UniformResource::StorageBuffer(mesh_vertices)),
                    UniformBinding::new(2, UniformResource::StorageBuffer(mesh_indices)),
                    UniformBinding::new(3, UniformResource::StorageBuffer(hit_positions)),
                    UniformBinding::new(4, UniformResource::StorageBuffer(normalmap_params)),
                    UniformBinding::new(5, UniformResource::Image(res.texture0)),
                ],
                res.normalmap_pipeline,
            )?;
            device.compute_list_bind_pipeline(list, res.normalmap_pipeline);
            device.compute_list_bind_uniform_set(list, set);
            device.compute_list_dispatch(list, tile_groups_x, tile_groups_y, tile_groups_z);
        }

        device.compute_list_add_barrier(list);

        // Stage 4: dilation, image 0 → image 1.
        {
            let set = device.uniform_set_create(
                &[
                    UniformBinding::new(0, UniformResource::Image(res.texture0)),
                    UniformBinding::new(1, UniformResource::Image(res.texture1)),
                    UniformBinding::new(2, UniformResource::UniformBuffer(dilation_params)),
                ],
                res.dilation_pipeline,
            )?;
            device.compute_list_bind_pipeline(list, res.dilation_pipeline);
            device.compute_list_bind_uniform_set(list, set);
            device.compute_list_dispatch(list, dilation_groups_x, dilation_groups_y, 1);
        }

        device.compute_list_add_barrier(list);

        // Stage 5: dilation back, image 1 → image 0. Same pipeline, swapped
        // images; the final result lands in image 0.
        {
            let set = device.uniform_set_create(
                &[
                    UniformBinding::new(0, UniformResource::Image(res.texture1)),
                    UniformBinding::new(1, UniformResource::Image(res.texture0)),
                    UniformBinding::new(2, UniformResource::UniformBuffer(dilation_params)),
                ],
                res.dilation_pipeline,
            )?;
            device.compute_list_bind_uniform_set(list, set);
            device.compute_list_dispatch(list, dilation_groups_x, dilation_groups_y, 1);
        }

        device.compute_list_end(list)?;
        Ok(())
    }

    /// Download the finished atlas, free all device resources, and build
    /// the follow-up CPU task that assembles the virtual texture.
    pub fn collect(
        &mut self,
        device: &mut dyn ComputeDevice,
    ) -> Result<VirtualTexturePass2Task, GpuTaskError> {
        let mut resources = self.resources.take().ok_or(GpuTaskError::NotPrepared)?;

        let atlas_data = device.texture_get_data(resources.texture0, 0);
        resources.release(device);
        let atlas_data = atlas_data?;

        let tiles = self
            .input
            .tile_data
            .iter()
            .map(|tile| NormalmapTile {
                cell: IVec3::new(tile.cell_x as i32, tile.cell_y as i32, tile.cell_z as i32),
                axis: tile.data & 0x3,
            })
            .collect();

        Ok(VirtualTexturePass2Task {
            atlas_data,
            tiles,
            atlas_width: self.input.texture_width,
            atlas_height: self.input.texture_height,
            tile_size_pixels: self.input.params.tile_size_pixels,
            block_position: self.input.block_position,
            block_size: self.input.block_size,
            lod_index: self.input.lod_index,
        })
    }

    /// Prepare, submit and collect in one call, as the GPU worker does.
    pub fn run(
        mut self,
        device: &mut dyn ComputeDevice,
    ) -> Result<VirtualTexturePass2Task, GpuTaskError> {
        self.prepare(device)?;
        self.collect(device)
    }
}

/// Follow-up CPU task: turns the downloaded atlas and its tile descriptors
/// into the final virtual-texture artifact.
pub struct VirtualTexturePass2Task {
    pub atlas_data: Vec<u8>,
    pub tiles: Vec<NormalmapTile>,
    pub atlas_width: u32,
    pub atlas_height: u32,
    pub tile_size_pixels: i32,
    pub block_position: IVec3,
    pub block_size: i32,
    pub lod_index: u8,
}

/// The finished per-block virtual texture.
pub struct VirtualTextureArtifact {
    pub atlas: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub tile_size_pixels: i32,
    pub tiles: Vec<NormalmapTile>,
    pub block_position: IVec3,
    pub lod_index: u8,
}

impl VirtualTexturePass2Task {
    pub fn run(self) -> VirtualTextureArtifact {
        debug_assert_eq!(
            self.atlas_data.len(),
            (self.atlas_width * self.atlas_height * 4) as usize,
            "atlas byte size does not match its dimensions"
        );
        VirtualTextureArtifact {
            atlas: self.atlas_data,
            width: self.atlas_width,
            height: self.atlas_height,
            tile_size_pixels: self.tile_size_pixels,
            tiles: self.tiles,
            block_position: self.block_position,
            lod_index: self.lod_index,
        }
    }
}

fn alloc_storage(
    device: &mut dyn ComputeDevice,
    res: &mut TaskResources,
    data: &[u8],
    label: &str,
) -> Result<BufferHandle, DeviceError> {
    let buffer = device.storage_buffer_create(data.len() as u64, Some(data), label)?;
    res.buffers.push(buffer);
    Ok(buffer)
}
