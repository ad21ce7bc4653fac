//! Streaming settings and volume description, persisted as RON.

use std::path::Path;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use strata_math::Box3i;

use crate::error::ConfigError;

/// Hard upper bound on LOD levels; per-viewer box state is sized for this.
pub const MAX_LOD_COUNT: u32 = 24;

/// Settings that drive clipbox streaming for one volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Number of LOD levels. Each level halves spatial resolution.
    pub lod_count: u32,
    /// Distance in voxels over which a LOD stays at full detail before the
    /// next level takes over.
    pub lod_distance: f32,
    /// Cap applied to every viewer's requested view distance, in voxels.
    pub view_distance_voxels: u32,
    /// Edge length of a data block as a power of two (e.g. 4 → 16 voxels).
    pub data_block_size_po2: u32,
    /// Edge length of a mesh block as a power of two. Must be at least the
    /// data block size.
    pub mesh_block_size_po2: u32,
    /// Most viewers the streaming state will pair at once.
    pub max_viewers: u32,
    /// Background worker threads for loading and meshing.
    pub worker_threads: usize,
    /// Maximum in-flight background tasks.
    pub task_budget: usize,
    /// Recompute LOD-seam transition masks after activations. Disable on
    /// server-only instances that never render.
    pub update_transition_masks: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            lod_count: 4,
            lod_distance: 48.0,
            view_distance_voxels: 512,
            data_block_size_po2: 4,
            mesh_block_size_po2: 4,
            max_viewers: 64,
            worker_threads: 4,
            task_budget: 64,
            update_transition_masks: true,
        }
    }
}

impl StreamingConfig {
    pub fn data_block_size(&self) -> i32 {
        1 << self.data_block_size_po2
    }

    pub fn mesh_block_size(&self) -> i32 {
        1 << self.mesh_block_size_po2
    }

    /// How many data blocks span one mesh block edge.
    pub fn mesh_to_data_factor(&self) -> i32 {
        self.mesh_block_size() / self.data_block_size()
    }

    /// Edge length in voxels of a chunk at the coarsest LOD.
    pub fn root_mesh_block_size(&self) -> i32 {
        self.mesh_block_size() << (self.lod_count - 1)
    }

    /// Check every range and relation the streaming core relies on.
    pub fn validate(&self, volume: &VolumeConfig) -> Result<(), ConfigError> {
        if self.lod_count == 0 || self.lod_count > MAX_LOD_COUNT {
            return Err(ConfigError::Invalid(format!(
                "lod_count must be in 1..={MAX_LOD_COUNT}, got {}",
                self.lod_count
            )));
        }
        if self.mesh_block_size_po2 < self.data_block_size_po2 {
            return Err(ConfigError::Invalid(format!(
                "mesh blocks ({}) must be at least as large as data blocks ({})",
                self.mesh_block_size(),
                self.data_block_size()
            )));
        }
        if self.lod_distance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "lod_distance must be positive, got {}",
                self.lod_distance
            )));
        }
        if self.view_distance_voxels == 0 {
            return Err(ConfigError::Invalid("view_distance_voxels must be positive".into()));
        }
        if self.max_viewers == 0 {
            return Err(ConfigError::Invalid("max_viewers must be positive".into()));
        }
        if self.worker_threads == 0 || self.task_budget == 0 {
            return Err(ConfigError::Invalid(
                "worker_threads and task_budget must be positive".into(),
            ));
        }

        // Bounds must tile exactly into chunks of the coarsest LOD, otherwise
        // the per-LOD bounds shifts are no longer exact.
        let root = self.data_block_size() << (self.lod_count - 1);
        let root_mesh = self.root_mesh_block_size();
        let largest = root.max(root_mesh);
        let bounds = volume.bounds_in_voxels;
        if bounds.pos % largest != IVec3::ZERO || bounds.size % largest != IVec3::ZERO {
            return Err(ConfigError::Invalid(format!(
                "volume bounds {bounds:?} are not a multiple of the largest LOD chunk ({largest})"
            )));
        }
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        ron::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let pretty = ron::ser::PrettyConfig::default();
        let content = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }
}

/// Static description of one voxel volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume bounds in LOD0 voxels. Must be a multiple of the largest LOD
    /// chunk on every axis.
    pub bounds_in_voxels: Box3i,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bounds_in_voxels: Box3i::new(IVec3::splat(-2048), IVec3::splat(4096)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamingConfig::default();
        let volume = VolumeConfig::default();
        assert!(config.validate(&volume).is_ok());
    }

    #[test]
    fn test_zero_lod_count_rejected() {
        let config = StreamingConfig {
            lod_count: 0,
            ..Default::default()
        };
        assert!(config.validate(&VolumeConfig::default()).is_err());
    }

    #[test]
    fn test_mesh_smaller_than_data_rejected() {
        let config = StreamingConfig {
            data_block_size_po2: 5,
            mesh_block_size_po2: 4,
            ..Default::default()
        };
        assert!(config.validate(&VolumeConfig::default()).is_err());
    }

    #[test]
    fn test_misaligned_bounds_rejected() {
        let config = StreamingConfig::default();
        let volume = VolumeConfig {
            bounds_in_voxels: Box3i::new(IVec3::splat(-100), IVec3::splat(200)),
        };
        let result = config.validate(&volume);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_mesh_to_data_factor() {
        let config = StreamingConfig {
            data_block_size_po2: 4,
            mesh_block_size_po2: 5,
            ..Default::default()
        };
        assert_eq!(config.mesh_to_data_factor(), 2);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = StreamingConfig::default();
        let text = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default()).unwrap();
        let parsed: StreamingConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed.lod_count, config.lod_count);
        assert_eq!(parsed.mesh_block_size_po2, config.mesh_block_size_po2);
    }
}
