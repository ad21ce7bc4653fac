//! GPU orchestration for per-tile detail normal maps.
//!
//! A [`normalmap::DetailNormalmapTask`] builds a 5-stage compute graph for
//! one mesh block (gather hits → SDF modifier → normal-map render → two
//! dilation passes) against the [`device::ComputeDevice`] abstraction, then
//! downloads the atlas and hands it to a follow-up
//! [`normalmap::VirtualTexturePass2Task`] that assembles the final
//! virtual-texture artifact. [`wgpu_device::WgpuComputeDevice`] is the
//! production backend.

pub mod device;
pub mod normalmap;
pub mod wgpu_device;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{
    BufferHandle, ComputeDevice, DeviceError, PipelineHandle, SamplerHandle, ShaderHandle,
    TextureHandle, UniformBinding, UniformResource, UniformSetHandle,
};
pub use normalmap::{
    DetailNormalmapInput, DetailNormalmapParams, DetailNormalmapTask, DetailShaders, GpuTaskError,
    ModifierTextureParam, NormalmapTile, SdfOperation, TileData, VirtualTextureArtifact,
    VirtualTexturePass2Task,
};
pub use wgpu_device::WgpuComputeDevice;
