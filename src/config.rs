// Per-instance configuration (fixed at construction)

use glam::Vec3;

use crate::float_key::SortOrder;
use crate::temporal_coherence::TemporalCoherenceConfig;

/// Sort behaviour of the tile path
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SortConfig {
    /// Copy an odd-pass result back into the primary buffers
    /// Default: false (consumers read whichever buffer `SortOutcome` names)
    pub copy_if_odd_passes: bool,
}

/// Projection and culling knobs
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectionConfig {
    /// Global splat scale multiplier (default: 1.0)
    pub splat_scale: f32,
    /// Global opacity multiplier (default: 1.0)
    pub opacity_scale: f32,
    /// Spherical harmonics degree (0-3, default: 3)
    pub sh_degree: u32,
    /// Frustum culling margin in NDC units (default: 0.2)
    /// 0.0 = tight culling, >0 = keeps splats whose center is just off-screen
    pub frustum_dilation: f32,
    /// Splats with alpha below this are culled (default: 1/255)
    pub alpha_cull_threshold: f32,
    /// View-space depth below which splats are culled (default: 0.2)
    pub near_plane: f32,
    /// Minimum projected extent in pixels, 0 disables (default: 0.0)
    pub min_extent_px: f32,
    /// Screen-space covariance dilation in px^2 (default: 0.3)
    pub low_pass: f32,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            splat_scale: 1.0,
            opacity_scale: 1.0,
            sh_degree: 3,
            frustum_dilation: 0.2,
            alpha_cull_threshold: 1.0 / 255.0,
            near_plane: 0.2,
            min_extent_px: 0.0,
            low_pass: 0.3,
        }
    }
}

impl ProjectionConfig {
    /// Base color only, tight frustum; cheapest projection
    pub fn fast() -> Self {
        Self {
            sh_degree: 0,
            frustum_dilation: 0.0,
            min_extent_px: 0.5,
            ..Default::default()
        }
    }
}

/// Tile binning knobs
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileConfig {
    /// Tile edge in pixels (default: 16)
    pub tile_size: u32,
    /// Entry buffer capacity as a multiple of the splat count (default: 3)
    pub duplication_ratio: u32,
    /// Depth bits in the composite key; None = every bit the tile index leaves
    pub depth_bits: Option<u32>,
    /// Color behind the last splat (default: black)
    pub background: Vec3,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_size: 16,
            duplication_ratio: 3,
            depth_bits: None,
            background: Vec3::ZERO,
        }
    }
}

impl TileConfig {
    /// Larger entry buffer for scenes with many large splats
    pub fn high_duplication() -> Self {
        Self {
            duplication_ratio: 8,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Splats the per-frame buffers are sized for up front; grows on demand
    pub splat_capacity: u32,
    /// Draw order encoded by the quad path's depth keys
    pub quad_order: SortOrder,
    pub projection: ProjectionConfig,
    pub tiles: TileConfig,
    pub sort: SortConfig,
    pub temporal: TemporalCoherenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            splat_capacity: 1 << 16,
            quad_order: SortOrder::BackToFront,
            projection: ProjectionConfig::default(),
            tiles: TileConfig::default(),
            sort: SortConfig::default(),
            temporal: TemporalCoherenceConfig::disabled(),
        }
    }
}

impl PipelineConfig {
    pub fn with_capacity(splat_capacity: u32) -> Self {
        Self {
            splat_capacity,
            ..Default::default()
        }
    }
}
