// Tile binning
// Every visible splat emits one (composite key, view index) entry per screen
// tile its footprint bounds touch. Key = tile index in the high bits and the
// positive depth float's top bits in the low bits, so one ascending sort
// groups entries by tile and orders each tile front to back.

use glam::{UVec2, Vec2};

use crate::buffer::GpuBuffer;
use crate::error::{Error, Result};
use crate::view_projector::{ViewRecord, COUNTER_ENTRIES};

/// Screen split into `tile_size` x `tile_size` pixel tiles (edge tiles may be partial)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub viewport: UVec2,
    pub tile_size: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileGrid {
    pub fn new(viewport: UVec2, tile_size: u32) -> Result<Self> {
        if viewport.x == 0 || viewport.y == 0 {
            return Err(Error::EmptyViewport(viewport.x, viewport.y));
        }
        let tile_size = tile_size.max(1);
        Ok(Self {
            viewport,
            tile_size,
            tiles_x: viewport.x.div_ceil(tile_size),
            tiles_y: viewport.y.div_ceil(tile_size),
        })
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles_x * self.tiles_y
    }

    pub fn tile_index(&self, x: u32, y: u32) -> u32 {
        y * self.tiles_x + x
    }

    /// Tile coordinates of a tile index
    pub fn tile_coords(&self, tile: u32) -> UVec2 {
        UVec2::new(tile % self.tiles_x, tile / self.tiles_x)
    }

    /// Pixel rectangle `[min, max)` of a tile, clipped to the viewport
    pub fn tile_pixels(&self, tile: u32) -> (UVec2, UVec2) {
        let min = self.tile_coords(tile) * self.tile_size;
        let max = (min + UVec2::splat(self.tile_size)).min(self.viewport);
        (min, max)
    }

    /// Tiles touched by the pixel bounds `[min, max]`:
    /// `[floor(min / T), ceil(max / T))` clamped to the grid
    pub fn span(&self, min: Vec2, max: Vec2) -> Option<TileSpan> {
        let t = self.tile_size as f32;
        let clamp = |v: f32, limit: u32| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                v.min(limit as f32) as u32
            }
        };
        let span = TileSpan {
            x0: clamp((min.x / t).floor(), self.tiles_x),
            y0: clamp((min.y / t).floor(), self.tiles_y),
            x1: clamp((max.x / t).ceil(), self.tiles_x),
            y1: clamp((max.y / t).ceil(), self.tiles_y),
        };
        (span.x0 < span.x1 && span.y0 < span.y1).then_some(span)
    }

    pub fn span_of(&self, record: &ViewRecord) -> Option<TileSpan> {
        let (min, max) = record.pixel_bounds();
        self.span(min, max)
    }
}

/// Half-open rectangle of tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileSpan {
    pub fn count(&self) -> u32 {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }

    /// Tile indices in row-major order
    pub fn tiles(self, grid: &TileGrid) -> impl Iterator<Item = u32> + '_ {
        (self.y0..self.y1).flat_map(move |y| (self.x0..self.x1).map(move |x| grid.tile_index(x, y)))
    }
}

/// Bit split of the composite tile key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeKeyLayout {
    pub tile_bits: u32,
    pub depth_bits: u32,
}

impl CompositeKeyLayout {
    /// `tile_bits = bits(tile_count - 1)` (at least 1); depth gets the rest,
    /// or `depth_bits` when that is smaller.
    pub fn new(tile_count: u32, depth_bits: Option<u32>) -> Result<Self> {
        let tile_bits = (u32::BITS - tile_count.saturating_sub(1).leading_zeros()).max(1);
        let available = u32::BITS - tile_bits;
        if available == 0 {
            return Err(Error::InvalidKeyBits(0));
        }
        let depth_bits = match depth_bits {
            Some(0) => return Err(Error::InvalidKeyBits(0)),
            Some(bits) => bits.min(available),
            None => available,
        };
        Ok(Self {
            tile_bits,
            depth_bits,
        })
    }

    /// Key bits the sort has to look at
    pub fn sort_bits(&self) -> u32 {
        self.tile_bits + self.depth_bits
    }

    /// Quantized depth: top `depth_bits` bits of the (positive) float
    #[inline]
    pub fn depth_key(&self, depth: f32) -> u32 {
        (depth.to_bits() & 0x7FFF_FFFF) >> (31 - self.depth_bits)
    }

    #[inline]
    pub fn key(&self, tile: u32, depth: f32) -> u32 {
        (tile << self.depth_bits) | self.depth_key(depth)
    }

    #[inline]
    pub fn tile_of(&self, key: u32) -> u32 {
        key >> self.depth_bits
    }
}

/// Writes tile entries for projected splats. Used inside the projection
/// dispatch; entries past the key buffer capacity are dropped but still
/// counted, so the entry counter exposes the overflow.
pub struct TileBinner<'a> {
    grid: TileGrid,
    layout: CompositeKeyLayout,
    keys: &'a GpuBuffer,
    payloads: &'a GpuBuffer,
    counters: &'a GpuBuffer,
    capacity: u32,
}

impl<'a> TileBinner<'a> {
    pub fn new(
        grid: TileGrid,
        layout: CompositeKeyLayout,
        keys: &'a GpuBuffer,
        payloads: &'a GpuBuffer,
        counters: &'a GpuBuffer,
    ) -> Self {
        let capacity = keys.len().min(payloads.len()).min(u32::MAX as usize) as u32;
        Self {
            grid,
            layout,
            keys,
            payloads,
            counters,
            capacity,
        }
    }

    /// Emits the entries of one record; returns how many it claimed
    pub fn emit(&self, record: &ViewRecord, view_index: u32) -> u32 {
        let Some(span) = self.grid.span_of(record) else {
            return 0;
        };
        let count = span.count();
        let base = self.counters.atomic_add(COUNTER_ENTRIES, count);
        let depth = self.layout.depth_key(record.depth);

        for (k, tile) in span.tiles(&self.grid).enumerate() {
            let index = base as u64 + k as u64;
            if index >= self.capacity as u64 {
                break;
            }
            self.keys
                .store(index as usize, (tile << self.layout.depth_bits) | depth);
            self.payloads.store(index as usize, view_index);
        }
        count
    }
}
