//! Rendering-device abstraction for compute work.
//!
//! The streaming core drives GPUs only through this trait: storage and
//! uniform buffers, RGBA8-UINT storage textures, compute pipelines built
//! from SPIR-V, uniform sets bound by index, and compute lists with
//! dispatches separated by barriers. Uniform sets release themselves once
//! their contents are freed; everything else is freed explicitly.

/// Errors reported by a compute device backend.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("resource allocation failed: {0}")]
    Allocation(String),

    #[error("unknown or invalid handle: {0}")]
    InvalidHandle(&'static str),

    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("device lost or submission failed: {0}")]
    Submission(String),
}

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// The reserved null handle.
            pub const NULL: $name = $name(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }
    };
}

handle_type!(
    /// A storage or uniform buffer owned by the device.
    BufferHandle
);
handle_type!(
    /// A 2D storage texture owned by the device.
    TextureHandle
);
handle_type!(
    /// A compiled compute shader (SPIR-V module).
    ShaderHandle
);
handle_type!(
    /// A compute pipeline built from a shader.
    PipelineHandle
);
handle_type!(
    /// A bound set of uniforms for one dispatch group.
    UniformSetHandle
);
handle_type!(
    /// A filtering sampler from the device's shared registry.
    SamplerHandle
);
handle_type!(
    /// An open compute list being recorded.
    ComputeListHandle
);

/// One resource bound into a uniform set.
#[derive(Clone, Copy, Debug)]
pub enum UniformResource {
    StorageBuffer(BufferHandle),
    UniformBuffer(BufferHandle),
    /// A storage image bound for load/store access.
    Image(TextureHandle),
    /// A sampled texture paired with a sampler.
    SamplerWithTexture(SamplerHandle, TextureHandle),
}

/// A `(binding index, resource)` pair within a uniform set.
#[derive(Clone, Copy, Debug)]
pub struct UniformBinding {
    pub binding: u32,
    pub resource: UniformResource,
}

impl UniformBinding {
    pub fn new(binding: u32, resource: UniformResource) -> Self {
        Self { binding, resource }
    }
}

/// A device that can allocate compute resources and run compute lists.
///
/// Backends must tolerate frees of handles they never issued (they log and
/// ignore), because task cleanup runs on partially-initialized tasks after
/// allocation failures.
pub trait ComputeDevice: Send {
    /// Compile a SPIR-V compute shader.
    fn shader_create(&mut self, spirv: &[u8], label: &str) -> Result<ShaderHandle, DeviceError>;

    /// Create a storage buffer, optionally with initial contents. When
    /// `data` is `None` the buffer is zero-initialized.
    fn storage_buffer_create(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        label: &str,
    ) -> Result<BufferHandle, DeviceError>;

    /// Create a uniform buffer with the given contents. Backends may require
    /// a minimum size (commonly 16 bytes).
    fn uniform_buffer_create(&mut self, data: &[u8], label: &str)
    -> Result<BufferHandle, DeviceError>;

    /// Create an RGBA8-UINT 2D texture usable as a storage image and as a
    /// copy source for readback.
    fn texture_2d_create(
        &mut self,
        width: u32,
        height: u32,
        label: &str,
    ) -> Result<TextureHandle, DeviceError>;

    fn compute_pipeline_create(&mut self, shader: ShaderHandle)
    -> Result<PipelineHandle, DeviceError>;

    /// Bind resources for set index 0 of `pipeline`.
    fn uniform_set_create(
        &mut self,
        bindings: &[UniformBinding],
        pipeline: PipelineHandle,
    ) -> Result<UniformSetHandle, DeviceError>;

    /// A filtering sampler from the device's shared registry.
    fn filtering_sampler(&mut self) -> SamplerHandle;

    fn compute_list_begin(&mut self) -> ComputeListHandle;
    fn compute_list_bind_pipeline(&mut self, list: ComputeListHandle, pipeline: PipelineHandle);
    fn compute_list_bind_uniform_set(&mut self, list: ComputeListHandle, set: UniformSetHandle);
    fn compute_list_dispatch(&mut self, list: ComputeListHandle, x: u32, y: u32, z: u32);
    /// Order all prior dispatches in the list before all later ones.
    fn compute_list_add_barrier(&mut self, list: ComputeListHandle);
    /// Finish recording and submit the list.
    fn compute_list_end(&mut self, list: ComputeListHandle) -> Result<(), DeviceError>;

    /// Download one layer of a texture as tightly packed RGBA8 bytes. Waits
    /// for in-flight work touching the texture.
    fn texture_get_data(
        &mut self,
        texture: TextureHandle,
        layer: u32,
    ) -> Result<Vec<u8>, DeviceError>;

    fn free_buffer(&mut self, buffer: BufferHandle);
    fn free_texture(&mut self, texture: TextureHandle);
    fn free_pipeline(&mut self, pipeline: PipelineHandle);
    fn free_shader(&mut self, shader: ShaderHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles() {
        assert!(BufferHandle::NULL.is_null());
        assert!(ShaderHandle::default().is_null());
        assert!(!TextureHandle(7).is_null());
    }
}
