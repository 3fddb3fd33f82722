// Splat sort pipeline
// Orchestrates one frame on a single in-order dispatch stream:
//
// quad path:  reset counters -> project (depth keys) -> draw args
//             -> indirect sort (32 bits)
// tile path:  reset counters -> project + tile emission -> indirect sort
//             (tile + depth bits) -> clear + build tile ranges -> rasterize
//
// All per-frame buffers are sized up front and reused. Nothing is read back
// to the host except through `read_stats` and the explicit read helpers.

use std::sync::Arc;

use glam::{Mat4, UVec2, Vec4};
use tracing::{debug, info, warn};

use crate::buffer::GpuBuffer;
use crate::camera::ViewCamera;
use crate::config::PipelineConfig;
use crate::device::{ComputeDevice, DrawArgs};
use crate::error::{ConfigurationError, Error, Result};
use crate::gaussian_splats::{GaussianSplats, SplatBuffers};
use crate::radix_sort::{RadixSorter, SortOutcome, SortScratch, MAX_SORT_COUNT};
use crate::splat_state::SplatState;
use crate::temporal_coherence::{should_skip_sorting, TemporalCoherenceCache, TemporalCoherenceStats};
use crate::tile_binner::{CompositeKeyLayout, TileBinner, TileGrid};
use crate::tile_ranges::{TileRange, TileRangeBuilder};
use crate::tile_rasterizer::TileRasterizer;
use crate::view_projector::{
    ProjectionMode, ProjectionTargets, ViewProjector, ViewRecord, COUNTER_ENTRIES, COUNTER_VISIBLE,
    COUNTER_WORDS, VIEW_RECORD_WORDS,
};

/// Result of a quad-path frame. The buffers are handles into the pipeline's
/// per-frame storage and stay valid until the next frame is rendered.
#[derive(Debug, Clone)]
pub struct QuadFrame {
    /// Sorted depth keys (the buffer `outcome` names)
    pub keys: GpuBuffer,
    /// View record indices in draw order
    pub payloads: GpuBuffer,
    pub view_records: GpuBuffer,
    /// One `DrawArgs`: 4 vertices per visible splat instance
    pub draw_args: GpuBuffer,
    pub outcome: SortOutcome,
    /// Previous frame's order reused by temporal coherence
    pub reused: bool,
}

/// Result of a tile-path frame
#[derive(Debug, Clone)]
pub struct TileFrame {
    /// RGBA f32 per pixel, row-major, y down
    pub color: GpuBuffer,
    /// `[start, end)` per tile
    pub ranges: GpuBuffer,
    /// Sorted composite keys
    pub keys: GpuBuffer,
    /// View record indices, grouped by tile, nearest first
    pub payloads: GpuBuffer,
    pub view_records: GpuBuffer,
    pub grid: TileGrid,
    pub layout: CompositeKeyLayout,
    pub outcome: SortOutcome,
}

/// Counters of the last rendered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub visible: u32,
    /// Tile entries emitted, including any that did not fit
    pub entries: u32,
    pub entry_capacity: u32,
}

impl FrameStats {
    /// Entries were dropped; the tile image is incomplete
    pub fn overflowed(&self) -> bool {
        self.entries > self.entry_capacity
    }
}

/// Reused per-frame storage, sized by splat capacity
struct FrameBuffers {
    splat_capacity: u32,
    entry_capacity: u32,
    records: GpuBuffer,
    counters: GpuBuffer,
    draw_args: GpuBuffer,
    quad_keys: GpuBuffer,
    quad_payloads: GpuBuffer,
    tile_keys: GpuBuffer,
    tile_payloads: GpuBuffer,
}

impl FrameBuffers {
    fn new(device: &ComputeDevice, splat_capacity: u32, duplication_ratio: u32) -> Self {
        let splat_capacity = splat_capacity.clamp(1, MAX_SORT_COUNT);
        let entry_capacity = (splat_capacity as u64 * duplication_ratio as u64)
            .clamp(1, MAX_SORT_COUNT as u64) as u32;
        debug!(
            "Allocating frame buffers: {} splats, {} tile entries",
            splat_capacity, entry_capacity
        );
        let n = splat_capacity as usize;
        Self {
            splat_capacity,
            entry_capacity,
            records: device.create_buffer("view_records", n * VIEW_RECORD_WORDS),
            counters: device.create_buffer("frame_counters", COUNTER_WORDS),
            draw_args: device.create_buffer(
                "quad_draw_args",
                crate::buffer::record_words::<DrawArgs>(),
            ),
            quad_keys: device.create_buffer("quad_sort_keys", n),
            quad_payloads: device.create_buffer("quad_sort_payloads", n),
            tile_keys: device.create_buffer("tile_sort_keys", entry_capacity as usize),
            tile_payloads: device.create_buffer("tile_sort_payloads", entry_capacity as usize),
        }
    }
}

/// Viewport-dependent tile storage
#[derive(Clone)]
struct TileTargets {
    grid: TileGrid,
    layout: CompositeKeyLayout,
    ranges: GpuBuffer,
    color: GpuBuffer,
}

pub struct SplatSortPipeline {
    device: Arc<ComputeDevice>,
    config: PipelineConfig,
    sorter: RadixSorter,
    projector: ViewProjector,
    range_builder: TileRangeBuilder,
    rasterizer: TileRasterizer,
    scene: Option<SplatBuffers>,
    frame: FrameBuffers,
    tile_targets: Option<TileTargets>,
    quad_scratch: SortScratch,
    tile_scratch: SortScratch,
    temporal_cache: TemporalCoherenceCache,
    temporal_stats: TemporalCoherenceStats,
    last_quad_frame: Option<QuadFrame>,
    last_projection: Option<(Mat4, UVec2)>,
}

impl SplatSortPipeline {
    pub fn new(device: Arc<ComputeDevice>, config: PipelineConfig) -> Self {
        let sorter = RadixSorter::new(device.clone());
        let projector = ViewProjector::new(device.clone(), config.projection);
        let range_builder = TileRangeBuilder::new(device.clone());
        let rasterizer = TileRasterizer::new(device.clone());

        let frame = FrameBuffers::new(&device, config.splat_capacity, config.tiles.duplication_ratio);
        let quad_scratch = sorter.create_scratch(frame.splat_capacity);
        let tile_scratch = sorter.create_scratch(frame.entry_capacity);

        info!(
            "Splat sort pipeline: {} splats, {} tile entries, {}px tiles, valid: {}",
            frame.splat_capacity,
            frame.entry_capacity,
            config.tiles.tile_size,
            sorter.is_valid()
        );

        Self {
            device,
            config,
            sorter,
            projector,
            range_builder,
            rasterizer,
            scene: None,
            frame,
            tile_targets: None,
            quad_scratch,
            tile_scratch,
            temporal_cache: TemporalCoherenceCache::default(),
            temporal_stats: TemporalCoherenceStats::default(),
            last_quad_frame: None,
            last_projection: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sorter.is_valid()
            && self.projector.is_valid()
            && self.range_builder.is_valid()
            && self.rasterizer.is_valid()
    }

    pub fn configuration_error(&self) -> Option<&ConfigurationError> {
        self.sorter.configuration_error()
    }

    pub fn device(&self) -> &Arc<ComputeDevice> {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scene(&self) -> Option<&SplatBuffers> {
        self.scene.as_ref()
    }

    pub fn temporal_stats(&self) -> &TemporalCoherenceStats {
        &self.temporal_stats
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::Invalid("splat sort pipeline"))
        }
    }

    /// Uploads a new scene, growing the per-frame buffers if needed
    pub fn prepare_scene(&mut self, splats: &GaussianSplats, state: Option<&SplatState>) -> Result<()> {
        self.ensure_valid()?;
        splats.validate()?;
        let count = splats.len();
        if count > MAX_SORT_COUNT as usize {
            return Err(Error::InvalidCount {
                count: count.min(u32::MAX as usize) as u32,
                max: MAX_SORT_COUNT,
            });
        }
        let count = count as u32;

        if count > self.frame.splat_capacity {
            self.frame = FrameBuffers::new(&self.device, count, self.config.tiles.duplication_ratio);
        }
        self.scene = Some(SplatBuffers::upload(&self.device, splats, state)?);
        // a new scene starts a fresh coherence history
        self.temporal_cache.reset();
        self.last_quad_frame = None;
        Ok(())
    }

    /// Replaces the per-splat state (e.g. after deleting splats)
    pub fn update_state(&mut self, state: Option<&SplatState>) -> Result<()> {
        let scene = self.scene.as_mut().ok_or(Error::SceneNotPrepared)?;
        scene.set_state(&self.device, state);
        self.invalidate_cached_order();
        Ok(())
    }

    fn invalidate_cached_order(&mut self) {
        self.temporal_cache.mark_data_updated();
        self.last_quad_frame = None;
    }

    /// Quad path: depth-sorted view records plus indirect draw arguments
    pub fn render_quads(&mut self, camera: &ViewCamera) -> Result<QuadFrame> {
        self.ensure_valid()?;
        if self.scene.is_none() {
            return Err(Error::SceneNotPrepared);
        }
        if camera.viewport.x == 0 || camera.viewport.y == 0 {
            return Err(Error::EmptyViewport(camera.viewport.x, camera.viewport.y));
        }

        let projection = (camera.projection, camera.viewport);
        if self.last_projection != Some(projection) {
            self.last_projection = Some(projection);
            self.temporal_cache.mark_data_updated();
        }
        // nothing to reuse: sort and restart the skip streak
        if self.last_quad_frame.is_none() {
            self.temporal_cache.mark_data_updated();
        }
        let skip = should_skip_sorting(
            &mut self.temporal_cache,
            &self.config.temporal,
            camera.position(),
            camera.forward(),
            camera.up(),
        );
        self.temporal_stats.update(skip, self.temporal_cache.skip_count);
        if let Some(previous) = self.last_quad_frame.as_ref().filter(|_| skip) {
            return Ok(QuadFrame {
                reused: true,
                ..previous.clone()
            });
        }

        let _span = tracing::trace_span!("Quad frame").entered();
        let Some(scene) = self.scene.as_ref() else {
            return Err(Error::SceneNotPrepared);
        };
        let frame = &self.frame;

        self.projector.reset_counters(&frame.counters);
        self.projector.project(
            camera,
            scene,
            &ProjectionTargets {
                records: &frame.records,
                counters: &frame.counters,
            },
            ProjectionMode::Depth {
                order: self.config.quad_order,
                keys: &frame.quad_keys,
                payloads: &frame.quad_payloads,
            },
        )?;
        self.projector.build_draw_args(&frame.counters, &frame.draw_args)?;
        let outcome = self.sorter.sort_indirect(
            &frame.counters,
            COUNTER_VISIBLE,
            &frame.quad_keys,
            &frame.quad_payloads,
            &mut self.quad_scratch,
            32,
            false,
        )?;

        let result = QuadFrame {
            keys: outcome.keys(&frame.quad_keys, &self.quad_scratch).clone(),
            payloads: outcome.payloads(&frame.quad_payloads, &self.quad_scratch).clone(),
            view_records: frame.records.clone(),
            draw_args: frame.draw_args.clone(),
            outcome,
            reused: false,
        };
        self.last_quad_frame = Some(result.clone());
        Ok(result)
    }

    fn tile_targets(&mut self, viewport: UVec2) -> Result<TileTargets> {
        if let Some(targets) = &self.tile_targets {
            if targets.grid.viewport == viewport {
                return Ok(targets.clone());
            }
        }
        let grid = TileGrid::new(viewport, self.config.tiles.tile_size)?;
        let layout = CompositeKeyLayout::new(grid.tile_count(), self.config.tiles.depth_bits)?;
        debug!(
            "Tile grid {}x{} ({} tiles), key bits: {} tile + {} depth",
            grid.tiles_x,
            grid.tiles_y,
            grid.tile_count(),
            layout.tile_bits,
            layout.depth_bits
        );
        let targets = TileTargets {
            grid,
            layout,
            ranges: self.range_builder.create_range_buffer(&grid),
            color: self.rasterizer.create_target(viewport),
        };
        self.tile_targets = Some(targets.clone());
        Ok(targets)
    }

    /// Tile path: binned, sorted, ranged and rasterized into the color target
    pub fn render_tiles(&mut self, camera: &ViewCamera) -> Result<TileFrame> {
        self.ensure_valid()?;
        if self.scene.is_none() {
            return Err(Error::SceneNotPrepared);
        }
        let targets = self.tile_targets(camera.viewport)?;
        // view records and counters are shared with the quad path
        self.last_quad_frame = None;
        self.temporal_cache.mark_data_updated();

        let _span = tracing::trace_span!("Tile frame", tiles = targets.grid.tile_count()).entered();
        let Some(scene) = self.scene.as_ref() else {
            return Err(Error::SceneNotPrepared);
        };
        let frame = &self.frame;

        self.projector.reset_counters(&frame.counters);
        self.projector.project(
            camera,
            scene,
            &ProjectionTargets {
                records: &frame.records,
                counters: &frame.counters,
            },
            ProjectionMode::Tiles(TileBinner::new(
                targets.grid,
                targets.layout,
                &frame.tile_keys,
                &frame.tile_payloads,
                &frame.counters,
            )),
        )?;

        let outcome = self.sorter.sort_indirect(
            &frame.counters,
            COUNTER_ENTRIES,
            &frame.tile_keys,
            &frame.tile_payloads,
            &mut self.tile_scratch,
            targets.layout.sort_bits(),
            self.config.sort.copy_if_odd_passes,
        )?;
        let keys = outcome.keys(&frame.tile_keys, &self.tile_scratch).clone();
        let payloads = outcome.payloads(&frame.tile_payloads, &self.tile_scratch).clone();

        self.range_builder.build(
            &targets.grid,
            &targets.layout,
            &frame.counters,
            COUNTER_ENTRIES,
            &keys,
            &targets.ranges,
        )?;
        self.rasterizer.rasterize(
            &targets.grid,
            &targets.ranges,
            &payloads,
            &frame.records,
            &targets.color,
            self.config.tiles.background,
        )?;

        Ok(TileFrame {
            color: targets.color,
            ranges: targets.ranges,
            keys,
            payloads,
            view_records: frame.records.clone(),
            grid: targets.grid,
            layout: targets.layout,
            outcome,
        })
    }

    /// Reads the frame counters back. Host/device sync point; keep it out
    /// of the per-frame hot path.
    pub fn read_stats(&self) -> FrameStats {
        let words = self.device.read_buffer(&self.frame.counters);
        let stats = FrameStats {
            visible: words.get(COUNTER_VISIBLE).copied().unwrap_or(0),
            entries: words.get(COUNTER_ENTRIES).copied().unwrap_or(0),
            entry_capacity: self.frame.entry_capacity,
        };
        if stats.overflowed() {
            warn!(
                "Tile entry buffer overflowed: {} entries, capacity {} (raise duplication_ratio)",
                stats.entries, stats.entry_capacity
            );
        }
        stats
    }

    pub fn read_draw_args(&self, frame: &QuadFrame) -> DrawArgs {
        frame.draw_args.read_record(0)
    }

    /// Sorted view records of a quad frame, in draw order
    pub fn read_draw_order(&self, frame: &QuadFrame) -> Vec<ViewRecord> {
        let visible = self.read_draw_args(frame).instance_count as usize;
        self.device
            .read_buffer(&frame.payloads)
            .iter()
            .take(visible)
            .map(|&index| frame.view_records.read_record(index as usize))
            .collect()
    }

    pub fn read_tile_ranges(&self, frame: &TileFrame) -> Vec<TileRange> {
        self.range_builder.read_ranges(&frame.grid, &frame.ranges)
    }

    pub fn read_pixels(&self, frame: &TileFrame) -> Vec<Vec4> {
        self.rasterizer.read_pixels(&frame.color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::float_key::SortOrder;
    use crate::radix_sort::ResultLocation;
    use crate::temporal_coherence::TemporalCoherenceConfig;
    use glam::{Quat, Vec3};

    fn camera(viewport: UVec2) -> ViewCamera {
        ViewCamera::look_at(
            Vec3::new(0.0, 0.0, 10.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_3,
            viewport,
        )
    }

    fn row_of_splats(n: usize) -> GaussianSplats {
        let mut splats = GaussianSplats::default();
        for i in 0..n {
            let z = -(i as f32) * 0.5;
            splats.push(Vec3::new(0.1 * i as f32, 0.0, z), Quat::IDENTITY, Vec3::splat(0.5), Vec3::ONE, 0.7);
        }
        splats
    }

    #[test]
    fn test_render_before_prepare_fails() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(16));
        assert!(matches!(
            pipeline.render_quads(&camera(UVec2::new(64, 64))),
            Err(Error::SceneNotPrepared)
        ));
        assert!(matches!(pipeline.update_state(None), Err(Error::SceneNotPrepared)));
    }

    #[test]
    fn test_invalid_device_disables_pipeline() {
        let device = Arc::new(ComputeDevice::new(DeviceProfile::downlevel_webgl2()));
        let mut pipeline = SplatSortPipeline::new(device, PipelineConfig::with_capacity(16));
        assert!(!pipeline.is_valid());
        assert!(pipeline.configuration_error().is_some());
        assert!(matches!(
            pipeline.prepare_scene(&row_of_splats(4), None),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_quad_frame_is_back_to_front() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(8));
        // grows past the initial capacity
        pipeline.prepare_scene(&row_of_splats(20), None).unwrap();
        let frame = pipeline.render_quads(&camera(UVec2::new(128, 96))).unwrap();

        assert!(!frame.reused);
        assert_eq!(frame.outcome.location, ResultLocation::Primary);
        let args = pipeline.read_draw_args(&frame);
        assert_eq!(args.vertex_count, 4);
        assert_eq!(args.instance_count, 20);
        assert_eq!(pipeline.read_stats().visible, 20);

        let order = pipeline.read_draw_order(&frame);
        assert_eq!(order.len(), 20);
        assert!(order.windows(2).all(|w| w[0].depth >= w[1].depth));
        assert_eq!(order[0].splat_id(), 19);
    }

    #[test]
    fn test_front_to_back_quad_order() {
        let config = PipelineConfig {
            quad_order: SortOrder::FrontToBack,
            ..PipelineConfig::with_capacity(32)
        };
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), config);
        pipeline.prepare_scene(&row_of_splats(10), None).unwrap();
        let frame = pipeline.render_quads(&camera(UVec2::new(128, 96))).unwrap();
        let order = pipeline.read_draw_order(&frame);
        assert!(order.windows(2).all(|w| w[0].depth <= w[1].depth));
    }

    #[test]
    fn test_deleted_splats_are_not_drawn() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(16));
        pipeline.prepare_scene(&row_of_splats(10), None).unwrap();
        let mut state = SplatState::new(10);
        state.select(&[0, 9]);
        state.delete_selected();
        pipeline.update_state(Some(&state)).unwrap();

        let frame = pipeline.render_quads(&camera(UVec2::new(128, 96))).unwrap();
        let order = pipeline.read_draw_order(&frame);
        assert_eq!(order.len(), 8);
        assert!(order.iter().all(|r| r.splat_id() != 0 && r.splat_id() != 9));
    }

    #[test]
    fn test_temporal_coherence_reuses_order() {
        let config = PipelineConfig {
            temporal: TemporalCoherenceConfig::default(),
            ..PipelineConfig::with_capacity(16)
        };
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), config);
        pipeline.prepare_scene(&row_of_splats(10), None).unwrap();
        let cam = camera(UVec2::new(128, 96));

        let first = pipeline.render_quads(&cam).unwrap();
        let second = pipeline.render_quads(&cam).unwrap();
        assert!(!first.reused);
        assert!(second.reused);
        assert!(second.payloads.same_buffer(&first.payloads));

        let moved = ViewCamera::look_at(Vec3::new(3.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y, std::f32::consts::FRAC_PI_3, cam.viewport);
        assert!(!pipeline.render_quads(&moved).unwrap().reused);

        // new data always re-sorts
        pipeline.prepare_scene(&row_of_splats(10), None).unwrap();
        assert!(!pipeline.render_quads(&moved).unwrap().reused);
        assert!(pipeline.temporal_stats().skipped_frames >= 1);
    }

    #[test]
    fn test_missing_cached_order_is_not_counted_as_skip() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(16));
        pipeline.prepare_scene(&row_of_splats(10), None).unwrap();
        let cam = camera(UVec2::new(128, 96));
        assert!(!pipeline.render_quads(&cam).unwrap().reused);

        // static camera, but the cached order is gone
        pipeline.last_quad_frame = None;
        let frame = pipeline.render_quads(&cam).unwrap();
        assert!(!frame.reused);
        assert_eq!(pipeline.temporal_stats().skipped_frames, 0);
        assert_eq!(pipeline.temporal_cache.skip_count, 0);
        assert_eq!(pipeline.read_draw_order(&frame).len(), 10);

        // the streak starts over from the re-sorted frame
        assert!(pipeline.render_quads(&cam).unwrap().reused);
        assert_eq!(pipeline.temporal_stats().skipped_frames, 1);
        assert_eq!(pipeline.temporal_cache.skip_count, 1);
    }

    #[test]
    fn test_mismatched_scene_is_rejected() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(16));
        let mut splats = row_of_splats(1);
        splats.means.push(Vec3::ONE);
        assert!(matches!(
            pipeline.prepare_scene(&splats, None),
            Err(Error::InconsistentSplatData {
                field: "rotations",
                expected: 2,
                found: 1
            })
        ));
        assert!(pipeline.scene().is_none());

        // a previously prepared scene survives a rejected upload
        pipeline.prepare_scene(&row_of_splats(3), None).unwrap();
        splats.raw_opacities.clear();
        assert!(pipeline.prepare_scene(&splats, None).is_err());
        assert_eq!(pipeline.scene().map(|s| s.count), Some(3));
    }

    #[test]
    fn test_tile_frame_small_scene() {
        let mut pipeline = SplatSortPipeline::new(Arc::new(ComputeDevice::default()), PipelineConfig::with_capacity(16));
        pipeline.prepare_scene(&row_of_splats(6), None).unwrap();
        let frame = pipeline.render_tiles(&camera(UVec2::new(64, 48))).unwrap();

        assert_eq!((frame.grid.tiles_x, frame.grid.tiles_y), (4, 3));
        let stats = pipeline.read_stats();
        assert_eq!(stats.visible, 6);
        assert!(!stats.overflowed());

        let ranges = pipeline.read_tile_ranges(&frame);
        assert_eq!(ranges.iter().map(|r| r.count).sum::<u32>(), stats.entries);

        let pixels = pipeline.read_pixels(&frame);
        assert_eq!(pixels.len(), 64 * 48);
        // splats sit around the image center
        let center = pixels[24 * 64 + 32];
        assert!(center.w > 0.5, "{center:?}");
        assert_eq!(pixels[0], Vec4::ZERO);
    }
}
