// Temporal Coherence for the quad path
// Reuses the previous frame's sorted order when the camera barely moved and
// no splat data changed, skipping projection and the radix sort entirely.

use glam::Vec3;
use tracing::info;

/// Camera state of the last sorted frame and the current skip streak
#[derive(Default, Clone, Debug)]
pub struct TemporalCoherenceCache {
    /// Last camera position
    pub last_camera_pos: Vec3,
    /// Last camera forward direction
    pub last_camera_dir: Vec3,
    /// Last camera up vector (for roll detection)
    pub last_camera_up: Vec3,
    /// Whether sorting was skipped last frame
    pub sorting_skipped: bool,
    /// Number of consecutive frames sorting was skipped
    pub skip_count: u32,
    /// Frame counter
    pub frame_count: u64,
    /// Splat data, state or projection changed since the last sort
    pub data_updated_this_frame: bool,
}

impl TemporalCoherenceCache {
    pub fn mark_data_updated(&mut self) {
        self.data_updated_this_frame = true;
    }

    /// Forget everything; the next frame always sorts
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn record_sorted(&mut self, camera_pos: Vec3, camera_dir: Vec3, camera_up: Vec3) {
        self.last_camera_pos = camera_pos;
        self.last_camera_dir = camera_dir;
        self.last_camera_up = camera_up;
        self.sorting_skipped = false;
        self.skip_count = 0;
        self.data_updated_this_frame = false;
    }
}

/// Configuration for temporal coherence optimization
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemporalCoherenceConfig {
    /// Enable temporal coherence optimization
    pub enabled: bool,

    /// Position movement threshold (in world units)
    /// Camera must move more than this to trigger re-sort
    /// Default: 0.01
    pub position_threshold: f32,

    /// Direction change threshold (dot product)
    /// 1.0 = no change, 0.0 = 90° change
    /// Default: 0.9999 (~0.8° rotation)
    pub direction_threshold: f32,

    /// Maximum frames to skip sorting
    /// Even if camera is static, re-sort periodically
    /// Default: 300 (5 seconds at 60fps)
    pub max_skip_frames: u32,

    /// Force re-sort every N frames regardless of camera movement
    /// 0 = disabled
    pub force_resort_interval: u32,
}

impl Default for TemporalCoherenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            position_threshold: 0.01,
            direction_threshold: 0.9999,
            max_skip_frames: 300,
            force_resort_interval: 0,
        }
    }
}

impl TemporalCoherenceConfig {
    /// Conservative profile (re-sort more often)
    pub fn conservative() -> Self {
        Self {
            enabled: true,
            position_threshold: 0.001,
            direction_threshold: 0.99995, // ~0.5° rotation
            max_skip_frames: 60,
            force_resort_interval: 0,
        }
    }

    /// Aggressive profile (skip sorting as much as possible)
    /// Use for static scenes
    pub fn aggressive() -> Self {
        Self {
            enabled: true,
            position_threshold: 0.1,
            direction_threshold: 0.999, // ~2.5° rotation
            max_skip_frames: 1000,
            force_resort_interval: 0,
        }
    }

    /// Disabled (always sort)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Check if sorting should be skipped based on camera movement.
/// Updates the cache either way.
pub fn should_skip_sorting(
    cache: &mut TemporalCoherenceCache,
    config: &TemporalCoherenceConfig,
    camera_pos: Vec3,
    camera_dir: Vec3,
    camera_up: Vec3,
) -> bool {
    // Always sort on first frame
    if cache.frame_count == 0 {
        cache.frame_count = 1;
        cache.record_sorted(camera_pos, camera_dir, camera_up);
        return false;
    }

    cache.frame_count += 1;

    let forced = config.force_resort_interval > 0
        && cache.frame_count % config.force_resort_interval as u64 == 0;
    if !config.enabled
        || cache.data_updated_this_frame
        || forced
        || cache.skip_count >= config.max_skip_frames
    {
        cache.record_sorted(camera_pos, camera_dir, camera_up);
        return false;
    }

    let pos_delta = camera_pos.distance(cache.last_camera_pos);
    let dir_dot = camera_dir.dot(cache.last_camera_dir);
    let up_dot = camera_up.dot(cache.last_camera_up);

    let camera_moved = pos_delta > config.position_threshold
        || dir_dot < config.direction_threshold
        || up_dot < config.direction_threshold; // roll

    if camera_moved {
        cache.record_sorted(camera_pos, camera_dir, camera_up);
        false
    } else {
        cache.sorting_skipped = true;
        cache.skip_count += 1;
        true
    }
}

/// Statistics for temporal coherence
#[derive(Default, Debug, Clone)]
pub struct TemporalCoherenceStats {
    /// Total frames rendered
    pub total_frames: u64,
    /// Frames where sorting was skipped
    pub skipped_frames: u64,
    /// Current skip streak
    pub current_skip_streak: u32,
    /// Longest skip streak
    pub max_skip_streak: u32,
    /// Average skip ratio (0.0 - 1.0)
    pub skip_ratio: f32,
}

impl TemporalCoherenceStats {
    pub fn update(&mut self, sorting_skipped: bool, skip_count: u32) {
        self.total_frames += 1;
        if sorting_skipped {
            self.skipped_frames += 1;
            self.current_skip_streak = skip_count;
            self.max_skip_streak = self.max_skip_streak.max(skip_count);
        } else {
            self.current_skip_streak = 0;
        }
        self.skip_ratio = self.skipped_frames as f32 / self.total_frames as f32;
    }

    pub fn log_summary(&self) {
        info!(
            "Temporal coherence: skip ratio {:.1}% ({}/{}), current streak {}, max streak {}",
            self.skip_ratio * 100.0,
            self.skipped_frames,
            self.total_frames,
            self.current_skip_streak,
            self.max_skip_streak
        );
    }
}
