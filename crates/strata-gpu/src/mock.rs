//! Recording compute device for tests: tracks allocations, dispatch shapes
//! and submissions, and can inject allocation failures.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::device::{
    BufferHandle, ComputeDevice, ComputeListHandle, DeviceError, PipelineHandle, SamplerHandle,
    ShaderHandle, TextureHandle, UniformBinding, UniformResource, UniformSetHandle,
};

#[derive(Default)]
pub struct MockDevice {
    next_id: u64,
    /// Buffer and texture allocations so far (shaders excluded).
    allocations: usize,
    /// When set, every allocation at or past this count fails.
    pub fail_after_allocations: Option<usize>,

    pub alive_buffers: FxHashSet<u64>,
    pub alive_textures: FxHashSet<u64>,
    pub alive_pipelines: FxHashSet<u64>,
    pub alive_shaders: FxHashSet<u64>,
    texture_sizes: FxHashMap<u64, (u32, u32)>,

    pub dispatches: Vec<(u32, u32, u32)>,
    pub barriers: usize,
    pub pipeline_binds: usize,
    pub uniform_set_binds: usize,
    pub submissions: usize,
    pub max_uniform_set_len: usize,
    /// Binding count of every uniform set created, in creation order.
    pub uniform_set_lens: Vec<usize>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_allocation(&mut self) -> Result<(), DeviceError> {
        if let Some(limit) = self.fail_after_allocations
            && self.allocations >= limit
        {
            return Err(DeviceError::Allocation("injected allocation failure".into()));
        }
        self.allocations += 1;
        Ok(())
    }
}

impl ComputeDevice for MockDevice {
    fn shader_create(&mut self, spirv: &[u8], _label: &str) -> Result<ShaderHandle, DeviceError> {
        if spirv.is_empty() {
            return Err(DeviceError::ShaderCompilation("empty SPIR-V".into()));
        }
        let id = self.next_handle();
        self.alive_shaders.insert(id);
        Ok(ShaderHandle(id))
    }

    fn storage_buffer_create(
        &mut self,
        _size: u64,
        _data: Option<&[u8]>,
        _label: &str,
    ) -> Result<BufferHandle, DeviceError> {
        self.check_allocation()?;
        let id = self.next_handle();
        self.alive_buffers.insert(id);
        Ok(BufferHandle(id))
    }

    fn uniform_buffer_create(
        &mut self,
        _data: &[u8],
        _label: &str,
    ) -> Result<BufferHandle, DeviceError> {
        self.check_allocation()?;
        let id = self.next_handle();
        self.alive_buffers.insert(id);
        Ok(BufferHandle(id))
    }

    fn texture_2d_create(
        &mut self,
        width: u32,
        height: u32,
        _label: &str,
    ) -> Result<TextureHandle, DeviceError> {
        self.check_allocation()?;
        let id = self.next_handle();
        self.alive_textures.insert(id);
        self.texture_sizes.insert(id, (width, height));
        Ok(TextureHandle(id))
    }

    fn compute_pipeline_create(
        &mut self,
        shader: ShaderHandle,
    ) -> Result<PipelineHandle, DeviceError> {
        if !self.alive_shaders.contains(&shader.0) {
            return Err(DeviceError::InvalidHandle("shader"));
        }
        let id = self.next_handle();
        self.alive_pipelines.insert(id);
        Ok(PipelineHandle(id))
    }

    fn uniform_set_create(
        &mut self,
        bindings: &[UniformBinding],
        pipeline: PipelineHandle,
    ) -> Result<UniformSetHandle, DeviceError> {
        if !self.alive_pipelines.contains(&pipeline.0) {
            return Err(DeviceError::InvalidHandle("pipeline"));
        }
        for binding in bindings {
            let alive = match binding.resource {
                UniformResource::StorageBuffer(b) | UniformResource::UniformBuffer(b) => {
                    self.alive_buffers.contains(&b.0)
                }
                UniformResource::Image(t) => self.alive_textures.contains(&t.0),
                UniformResource::SamplerWithTexture(_, t) => self.alive_textures.contains(&t.0),
            };
            if !alive {
                return Err(DeviceError::InvalidHandle("uniform resource"));
            }
        }
        self.max_uniform_set_len = self.max_uniform_set_len.max(bindings.len());
        self.uniform_set_lens.push(bindings.len());
        Ok(UniformSetHandle(self.next_handle()))
    }

    fn filtering_sampler(&mut self) -> SamplerHandle {
        SamplerHandle(u64::MAX)
    }

    fn compute_list_begin(&mut self) -> ComputeListHandle {
        ComputeListHandle(self.next_handle())
    }

    fn compute_list_bind_pipeline(&mut self, _list: ComputeListHandle, _pipeline: PipelineHandle) {
        self.pipeline_binds += 1;
    }

    fn compute_list_bind_uniform_set(&mut self, _list: ComputeListHandle, _set: UniformSetHandle) {
        self.uniform_set_binds += 1;
    }

    fn compute_list_dispatch(&mut self, _list: ComputeListHandle, x: u32, y: u32, z: u32) {
        self.dispatches.push((x, y, z));
    }

    fn compute_list_add_barrier(&mut self, _list: ComputeListHandle) {
        self.barriers += 1;
    }

    fn compute_list_end(&mut self, _list: ComputeListHandle) -> Result<(), DeviceError> {
        self.submissions += 1;
        Ok(())
    }

    fn texture_get_data(
        &mut self,
        texture: TextureHandle,
        _layer: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        let (width, height) = self
            .texture_sizes
            .get(&texture.0)
            .copied()
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        Ok(vec![0; (width * height * 4) as usize])
    }

    fn free_buffer(&mut self, buffer: BufferHandle) {
        self.alive_buffers.remove(&buffer.0);
    }

    fn free_texture(&mut self, texture: TextureHandle) {
        self.alive_textures.remove(&texture.0);
        self.texture_sizes.remove(&texture.0);
    }

    fn free_pipeline(&mut self, pipeline: PipelineHandle) {
        self.alive_pipelines.remove(&pipeline.0);
    }

    fn free_shader(&mut self, shader: ShaderHandle) {
        self.alive_shaders.remove(&shader.0);
    }
}
