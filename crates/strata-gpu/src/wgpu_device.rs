//! `wgpu` backend for [`ComputeDevice`].
//!
//! Handles map to retained `wgpu` objects; compute lists are recorded as an
//! op list and replayed into command encoders on `compute_list_end`, with
//! each barrier splitting the work into a new compute pass so earlier
//! dispatches complete before later ones read their output.
//!
//! A combined sampler-with-texture binding occupies two `wgpu` bindings:
//! the sampler at the requested index and the texture view at the next one.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::device::{
    BufferHandle, ComputeDevice, ComputeListHandle, DeviceError, PipelineHandle, SamplerHandle,
    ShaderHandle, TextureHandle, UniformBinding, UniformResource, UniformSetHandle,
};

enum ListOp {
    BindPipeline(PipelineHandle),
    BindUniformSet(UniformSetHandle),
    Dispatch(u32, u32, u32),
    Barrier,
}

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// [`ComputeDevice`] implemented over a `wgpu` device and queue.
pub struct WgpuComputeDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_id: u64,
    buffers: FxHashMap<u64, wgpu::Buffer>,
    textures: FxHashMap<u64, TextureEntry>,
    shaders: FxHashMap<u64, wgpu::ShaderModule>,
    pipelines: FxHashMap<u64, wgpu::ComputePipeline>,
    bind_groups: FxHashMap<u64, wgpu::BindGroup>,
    samplers: FxHashMap<u64, wgpu::Sampler>,
    filtering_sampler: SamplerHandle,
    recorded_ops: FxHashMap<u64, Vec<ListOp>>,
}

impl WgpuComputeDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            next_id: 0,
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            shaders: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            bind_groups: FxHashMap::default(),
            samplers: FxHashMap::default(),
            filtering_sampler: SamplerHandle::NULL,
            recorded_ops: FxHashMap::default(),
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl ComputeDevice for WgpuComputeDevice {
    fn shader_create(&mut self, spirv: &[u8], label: &str) -> Result<ShaderHandle, DeviceError> {
        if spirv.is_empty() || spirv.len() % 4 != 0 {
            return Err(DeviceError::ShaderCompilation(format!(
                "SPIR-V blob for {label:?} has invalid length {}",
                spirv.len()
            )));
        }
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::util::make_spirv(spirv),
        });
        let id = self.next_handle();
        self.shaders.insert(id, module);
        Ok(ShaderHandle(id))
    }

    fn storage_buffer_create(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        label: &str,
    ) -> Result<BufferHandle, DeviceError> {
        if size == 0 {
            return Err(DeviceError::Allocation(format!("zero-size buffer {label:?}")));
        }
        let usage =
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        let buffer = match data {
            Some(contents) => {
                use wgpu::util::DeviceExt;
                self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage,
                })
            }
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            }),
        };
        let id = self.next_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn uniform_buffer_create(
        &mut self,
        data: &[u8],
        label: &str,
    ) -> Result<BufferHandle, DeviceError> {
        if data.is_empty() {
            return Err(DeviceError::Allocation(format!("empty uniform buffer {label:?}")));
        }
        use wgpu::util::DeviceExt;
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: data,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let id = self.next_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn texture_2d_create(
        &mut self,
        width: u32,
        height: u32,
        label: &str,
    ) -> Result<TextureHandle, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::Allocation(format!("zero-size texture {label:?}")));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Uint,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.next_handle();
        self.textures.insert(id, TextureEntry { texture, view, width, height });
        Ok(TextureHandle(id))
    }

    fn compute_pipeline_create(
        &mut self,
        shader: ShaderHandle,
    ) -> Result<PipelineHandle, DeviceError> {
        let module = self
            .shaders
            .get(&shader.0)
            .ok_or(DeviceError::InvalidHandle("shader"))?;
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: None,
            layout: None,
            module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        let id = self.next_handle();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn uniform_set_create(
        &mut self,
        bindings: &[UniformBinding],
        pipeline: PipelineHandle,
    ) -> Result<UniformSetHandle, DeviceError> {
        let pipeline = self
            .pipelines
            .get(&pipeline.0)
            .ok_or(DeviceError::InvalidHandle("pipeline"))?;

        let mut entries = Vec::with_capacity(bindings.len() + 1);
        for binding in bindings {
            match binding.resource {
                UniformResource::StorageBuffer(buffer) | UniformResource::UniformBuffer(buffer) => {
                    let buffer = self
                        .buffers
                        .get(&buffer.0)
                        .ok_or(DeviceError::InvalidHandle("buffer"))?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: buffer.as_entire_binding(),
                    });
                }
                UniformResource::Image(texture) => {
                    let entry = self
                        .textures
                        .get(&texture.0)
                        .ok_or(DeviceError::InvalidHandle("texture"))?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: wgpu::BindingResource::TextureView(&entry.view),
                    });
                }
                UniformResource::SamplerWithTexture(sampler, texture) => {
                    let sampler = self
                        .samplers
                        .get(&sampler.0)
                        .ok_or(DeviceError::InvalidHandle("sampler"))?;
                    let entry = self
                        .textures
                        .get(&texture.0)
                        .ok_or(DeviceError::InvalidHandle("texture"))?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    });
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding + 1,
                        resource: wgpu::BindingResource::TextureView(&entry.view),
                    });
                }
            }
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        let id = self.next_id + 1;
        self.next_id = id;
        self.bind_groups.insert(id, bind_group);
        Ok(UniformSetHandle(id))
    }

    fn filtering_sampler(&mut self) -> SamplerHandle {
        if self.filtering_sampler.is_null() {
            let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("strata-filtering-sampler"),
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            });
            let id = self.next_handle();
            self.samplers.insert(id, sampler);
            self.filtering_sampler = SamplerHandle(id);
        }
        self.filtering_sampler
    }

    fn compute_list_begin(&mut self) -> ComputeListHandle {
        let id = self.next_handle();
        self.recorded_ops.insert(id, Vec::new());
        ComputeListHandle(id)
    }

    fn compute_list_bind_pipeline(&mut self, list: ComputeListHandle, pipeline: PipelineHandle) {
        if let Some(ops) = self.recorded_ops.get_mut(&list.0) {
            ops.push(ListOp::BindPipeline(pipeline));
        }
    }

    fn compute_list_bind_uniform_set(&mut self, list: ComputeListHandle, set: UniformSetHandle) {
        if let Some(ops) = self.recorded_ops.get_mut(&list.0) {
            ops.push(ListOp::BindUniformSet(set));
        }
    }

    fn compute_list_dispatch(&mut self, list: ComputeListHandle, x: u32, y: u32, z: u32) {
        if let Some(ops) = self.recorded_ops.get_mut(&list.0) {
            ops.push(ListOp::Dispatch(x, y, z));
        }
    }

    fn compute_list_add_barrier(&mut self, list: ComputeListHandle) {
        if let Some(ops) = self.recorded_ops.get_mut(&list.0) {
            ops.push(ListOp::Barrier);
        }
    }

    fn compute_list_end(&mut self, list: ComputeListHandle) -> Result<(), DeviceError> {
        let ops = self
            .recorded_ops
            .remove(&list.0)
            .ok_or(DeviceError::InvalidHandle("compute list"))?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("strata-compute") });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            let mut current_pipeline: Option<PipelineHandle> = None;
            let mut current_set: Option<UniformSetHandle> = None;

            for op in &ops {
                match op {
                    ListOp::BindPipeline(handle) => {
                        let pipeline = self
                            .pipelines
                            .get(&handle.0)
                            .ok_or(DeviceError::InvalidHandle("pipeline"))?;
                        pass.set_pipeline(pipeline);
                        current_pipeline = Some(*handle);
                    }
                    ListOp::BindUniformSet(handle) => {
                        let bind_group = self
                            .bind_groups
                            .get(&handle.0)
                            .ok_or(DeviceError::InvalidHandle("uniform set"))?;
                        pass.set_bind_group(0, bind_group, &[]);
                        current_set = Some(*handle);
                    }
                    ListOp::Dispatch(x, y, z) => {
                        pass.dispatch_workgroups(*x, *y, *z);
                    }
                    ListOp::Barrier => {
                        // A pass boundary orders all prior dispatches before
                        // later ones. Rebind the current state, since a new
                        // pass starts clean.
                        drop(pass);
                        pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                            label: None,
                            timestamp_writes: None,
                        });
                        if let Some(handle) = current_pipeline {
                            let pipeline = self
                                .pipelines
                                .get(&handle.0)
                                .ok_or(DeviceError::InvalidHandle("pipeline"))?;
                            pass.set_pipeline(pipeline);
                        }
                        if let Some(handle) = current_set {
                            let bind_group = self
                                .bind_groups
                                .get(&handle.0)
                                .ok_or(DeviceError::InvalidHandle("uniform set"))?;
                            pass.set_bind_group(0, bind_group, &[]);
                        }
                    }
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        // Uniform sets auto-release after submission.
        self.bind_groups.clear();
        Ok(())
    }

    fn texture_get_data(
        &mut self,
        texture: TextureHandle,
        layer: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        if layer != 0 {
            return Err(DeviceError::InvalidHandle("layer"));
        }
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        let (width, height) = (entry.width, entry.height);

        let unpadded_bytes_per_row = width * 4;
        let padded_bytes_per_row = unpadded_bytes_per_row
            .div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("strata-readback"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("strata-readback") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Submission(format!("poll failed: {e:?}")))?;
        receiver
            .recv()
            .map_err(|_| DeviceError::Submission("map callback dropped".into()))?
            .map_err(|e| DeviceError::Submission(format!("readback map failed: {e:?}")))?;

        let mapped = slice.get_mapped_range();
        let mut data = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        for row in 0..height {
            let start = (row * padded_bytes_per_row) as usize;
            data.extend_from_slice(&mapped[start..start + unpadded_bytes_per_row as usize]);
        }
        drop(mapped);
        staging.unmap();

        Ok(data)
    }

    fn free_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_none() {
            warn!(handle = buffer.0, "freeing unknown buffer");
        }
    }

    fn free_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture.0).is_none() {
            warn!(handle = texture.0, "freeing unknown texture");
        }
    }

    fn free_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline.0).is_none() {
            warn!(handle = pipeline.0, "freeing unknown pipeline");
        }
    }

    fn free_shader(&mut self, shader: ShaderHandle) {
        if self.shaders.remove(&shader.0).is_none() {
            warn!(handle = shader.0, "freeing unknown shader");
        }
    }
}
