// Tile rasterizer
// One workgroup per tile, one lane per pixel. The tile's range of the sorted
// entry array is walked strictly in order (nearest first), staging view
// records in batches the way a shader would stage them in workgroup memory.
// Each lane composites front to back and retires once it is opaque.

use std::sync::Arc;

use glam::{UVec2, Vec2, Vec3, Vec4};
use tracing::warn;

use crate::buffer::GpuBuffer;
use crate::device::{
    for_each_block, linear_workgroups, Capabilities, ComputeDevice, Kernel, WorkgroupId,
    Workgroups,
};
use crate::error::{ConfigurationError, Error, Result};
use crate::tile_binner::TileGrid;
use crate::tile_ranges::load_range;
use crate::view_projector::ViewRecord;

/// RGBA f32 per pixel
pub const PIXEL_WORDS: usize = 4;
/// View records staged per batch
pub const BATCH_SIZE: u32 = 256;

const MAX_ALPHA: f32 = 0.99;
const MIN_ALPHA: f32 = 1.0 / 255.0;
const TRANSMITTANCE_CUTOFF: f32 = 1e-4;
/// Footprint edge in ellipse coordinates (s^2 + t^2)
const FOOTPRINT_RADIUS_SQ: f32 = 4.0;

/// Composites one pixel over an ordered record list. Returns the
/// accumulated color and the remaining transmittance.
pub fn composite_pixel<'r>(
    pixel: Vec2,
    records: impl IntoIterator<Item = &'r ViewRecord>,
    mut color: Vec3,
    mut transmittance: f32,
) -> (Vec3, f32) {
    for record in records {
        if transmittance < TRANSMITTANCE_CUTOFF {
            break;
        }
        let d2 = record.ellipse_coords(pixel).length_squared();
        if d2.is_nan() || d2 > FOOTPRINT_RADIUS_SQ {
            continue;
        }
        let rgba = record.color();
        let alpha = (rgba.w * (-d2).exp()).min(MAX_ALPHA);
        if alpha < MIN_ALPHA {
            continue;
        }
        color += transmittance * alpha * rgba.truncate();
        transmittance *= 1.0 - alpha;
    }
    (color, transmittance)
}

pub struct TileRasterizer {
    device: Arc<ComputeDevice>,
    configuration_error: Option<ConfigurationError>,
}

impl TileRasterizer {
    pub fn new(device: Arc<ComputeDevice>) -> Self {
        let configuration_error = Capabilities::check(device.profile()).err();
        if let Some(err) = &configuration_error {
            warn!("Tile rasterizer disabled: {}", err);
        }
        Self {
            device,
            configuration_error,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.configuration_error.is_none()
    }

    pub fn create_target(&self, viewport: UVec2) -> GpuBuffer {
        self.device.create_buffer(
            "tile_color_target",
            viewport.x as usize * viewport.y as usize * PIXEL_WORDS,
        )
    }

    /// `payloads` are view record indices in sorted order; `ranges` is the
    /// table written by `TileRangeBuilder::build`.
    pub fn rasterize(
        &self,
        grid: &TileGrid,
        ranges: &GpuBuffer,
        payloads: &GpuBuffer,
        records: &GpuBuffer,
        target: &GpuBuffer,
        background: Vec3,
    ) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Invalid("tile rasterizer"));
        }
        let required = grid.viewport.x as usize * grid.viewport.y as usize * PIXEL_WORDS;
        if target.len() < required {
            return Err(Error::CapacityExceeded {
                what: "color target",
                required,
                capacity: target.len(),
            });
        }

        self.device.dispatch(
            &RasterizeKernel {
                grid: *grid,
                ranges,
                payloads,
                records,
                target,
                background,
            },
            Workgroups::Direct(linear_workgroups(grid.tile_count(), 1)),
        );
        Ok(())
    }

    /// Reads the color target back (host sync point)
    pub fn read_pixels(&self, target: &GpuBuffer) -> Vec<Vec4> {
        self.device
            .read_buffer(target)
            .chunks_exact(PIXEL_WORDS)
            .map(|p| {
                Vec4::new(
                    f32::from_bits(p[0]),
                    f32::from_bits(p[1]),
                    f32::from_bits(p[2]),
                    f32::from_bits(p[3]),
                )
            })
            .collect()
    }
}

struct RasterizeKernel<'a> {
    grid: TileGrid,
    ranges: &'a GpuBuffer,
    payloads: &'a GpuBuffer,
    records: &'a GpuBuffer,
    target: &'a GpuBuffer,
    background: Vec3,
}

impl RasterizeKernel<'_> {
    fn shade_tile(&self, tile: u32) {
        let (min, max) = self.grid.tile_pixels(tile);
        let size = max - min;
        let lanes = (size.x * size.y) as usize;
        let mut color = vec![Vec3::ZERO; lanes];
        let mut transmittance = vec![1.0f32; lanes];

        let range = load_range(self.ranges, tile);
        let mut batch = Vec::with_capacity(BATCH_SIZE as usize);
        let mut start = range.start;
        while start < range.end() {
            let end = (start + BATCH_SIZE).min(range.end());
            batch.clear();
            batch.extend((start..end).map(|i| {
                let view_index = self.payloads.load(i as usize);
                self.records.read_record::<ViewRecord>(view_index as usize)
            }));

            let mut active = false;
            for lane in 0..lanes {
                if transmittance[lane] < TRANSMITTANCE_CUTOFF {
                    continue;
                }
                let pixel = min + UVec2::new(lane as u32 % size.x, lane as u32 / size.x);
                let (c, t) = composite_pixel(
                    pixel.as_vec2() + Vec2::splat(0.5),
                    &batch,
                    color[lane],
                    transmittance[lane],
                );
                color[lane] = c;
                transmittance[lane] = t;
                active |= t >= TRANSMITTANCE_CUTOFF;
            }
            if !active {
                break;
            }
            start = end;
        }

        let width = self.grid.viewport.x as usize;
        for lane in 0..lanes {
            let pixel = min + UVec2::new(lane as u32 % size.x, lane as u32 / size.x);
            let rgb = color[lane] + transmittance[lane] * self.background;
            let base = (pixel.y as usize * width + pixel.x as usize) * PIXEL_WORDS;
            self.target.store_f32(base, rgb.x);
            self.target.store_f32(base + 1, rgb.y);
            self.target.store_f32(base + 2, rgb.z);
            self.target.store_f32(base + 3, 1.0 - transmittance[lane]);
        }
    }
}

impl Kernel for RasterizeKernel<'_> {
    fn label(&self) -> &'static str {
        "tile_rasterize"
    }

    fn execute(&self, group: WorkgroupId) {
        for_each_block(group, self.grid.tile_count(), 1, |tiles| {
            for tile in tiles {
                self.shade_tile(tile);
            }
        });
    }
}
