// Tile range building
// After the tile-path sort, each tile's entries are one contiguous run of
// the sorted key array. One lane per entry compares its tile with its
// predecessor's: a change (or index 0) opens the tile's range at this index
// and closes the predecessor tile's range. Tiles without entries keep the
// cleared [0, 0) range.
//
// Range table layout: 2 words per tile, [start, end).

use std::sync::Arc;

use tracing::warn;

use crate::buffer::GpuBuffer;
use crate::device::{
    for_each_block, linear_workgroups, Capabilities, ComputeDevice, DispatchArgs, Kernel,
    WorkgroupId, Workgroups, REQUIRED_INVOCATIONS_PER_WORKGROUP,
};
use crate::error::{ConfigurationError, Error, Result};
use crate::tile_binner::{CompositeKeyLayout, TileGrid};

pub const RANGE_WORDS_PER_TILE: usize = 2;

// State words: clamped entry count, then the boundary pass DispatchArgs
const STATE_COUNT: usize = 0;
const STATE_ARGS: usize = 1;
const STATE_WORDS: usize = STATE_ARGS + DispatchArgs::WORDS;

/// Host view of one tile's entries in the sorted array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRange {
    pub start: u32,
    pub count: u32,
}

impl TileRange {
    pub fn end(&self) -> u32 {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct TileRangeBuilder {
    device: Arc<ComputeDevice>,
    state: GpuBuffer,
    configuration_error: Option<ConfigurationError>,
}

impl TileRangeBuilder {
    pub fn new(device: Arc<ComputeDevice>) -> Self {
        let configuration_error = Capabilities::check(device.profile()).err();
        if let Some(err) = &configuration_error {
            warn!("Tile range builder disabled: {}", err);
        }
        let state = device.create_buffer("tile_range_state", STATE_WORDS);
        Self {
            device,
            state,
            configuration_error,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.configuration_error.is_none()
    }

    pub fn create_range_buffer(&self, grid: &TileGrid) -> GpuBuffer {
        self.device
            .create_buffer("tile_ranges", grid.tile_count() as usize * RANGE_WORDS_PER_TILE)
    }

    /// Clears the range table and rebuilds it from `sorted_keys`. The entry
    /// count is read from `count_buffer[count_offset]` on the device and
    /// clamped to the key buffer length.
    pub fn build(
        &self,
        grid: &TileGrid,
        layout: &CompositeKeyLayout,
        count_buffer: &GpuBuffer,
        count_offset: usize,
        sorted_keys: &GpuBuffer,
        ranges: &GpuBuffer,
    ) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Invalid("tile range builder"));
        }
        let required = grid.tile_count() as usize * RANGE_WORDS_PER_TILE;
        if ranges.len() < required {
            return Err(Error::CapacityExceeded {
                what: "tile range buffer",
                required,
                capacity: ranges.len(),
            });
        }

        let _span = tracing::trace_span!("Tile ranges", tiles = grid.tile_count()).entered();
        self.device.clear_buffer(ranges);
        self.device.dispatch(
            &PrepareRangesKernel {
                count: count_buffer,
                count_offset,
                capacity: sorted_keys.len().min(u32::MAX as usize) as u32,
                state: &self.state,
            },
            Workgroups::Direct(1),
        );
        self.device.dispatch(
            &RangeBoundaryKernel {
                keys: sorted_keys,
                ranges,
                state: &self.state,
                depth_bits: layout.depth_bits,
            },
            Workgroups::Indirect {
                args: &self.state,
                offset: STATE_ARGS,
            },
        );
        Ok(())
    }

    /// Reads the range table back (host sync point)
    pub fn read_ranges(&self, grid: &TileGrid, ranges: &GpuBuffer) -> Vec<TileRange> {
        let words = self.device.read_buffer(ranges);
        words
            .chunks_exact(RANGE_WORDS_PER_TILE)
            .take(grid.tile_count() as usize)
            .map(|w| TileRange {
                start: w[0],
                count: w[1].saturating_sub(w[0]),
            })
            .collect()
    }
}

/// Reads one tile's range from the device table
#[inline]
pub fn load_range(ranges: &GpuBuffer, tile: u32) -> TileRange {
    let base = tile as usize * RANGE_WORDS_PER_TILE;
    let start = ranges.load(base);
    TileRange {
        start,
        count: ranges.load(base + 1).saturating_sub(start),
    }
}

struct PrepareRangesKernel<'a> {
    count: &'a GpuBuffer,
    count_offset: usize,
    capacity: u32,
    state: &'a GpuBuffer,
}

impl Kernel for PrepareRangesKernel<'_> {
    fn label(&self) -> &'static str {
        "tile_ranges_prepare"
    }

    fn execute(&self, _group: WorkgroupId) {
        let count = self.count.atomic_load(self.count_offset).min(self.capacity);
        self.state.store(STATE_COUNT, count);
        let args = DispatchArgs::linear(linear_workgroups(count, REQUIRED_INVOCATIONS_PER_WORKGROUP));
        self.state.store(STATE_ARGS, args.x);
        self.state.store(STATE_ARGS + 1, args.y);
        self.state.store(STATE_ARGS + 2, args.z);
    }
}

struct RangeBoundaryKernel<'a> {
    keys: &'a GpuBuffer,
    ranges: &'a GpuBuffer,
    state: &'a GpuBuffer,
    depth_bits: u32,
}

impl Kernel for RangeBoundaryKernel<'_> {
    fn label(&self) -> &'static str {
        "tile_ranges_boundaries"
    }

    fn execute(&self, group: WorkgroupId) {
        let count = self.state.load(STATE_COUNT);
        for_each_block(group, count, REQUIRED_INVOCATIONS_PER_WORKGROUP, |range| {
            for i in range {
                let tile = (self.keys.load(i as usize) >> self.depth_bits) as usize;
                if i == 0 {
                    self.ranges.store(tile * RANGE_WORDS_PER_TILE, 0);
                } else {
                    let prev = (self.keys.load(i as usize - 1) >> self.depth_bits) as usize;
                    if prev != tile {
                        self.ranges.store(prev * RANGE_WORDS_PER_TILE + 1, i);
                        self.ranges.store(tile * RANGE_WORDS_PER_TILE, i);
                    }
                }
                if i + 1 == count {
                    self.ranges.store(tile * RANGE_WORDS_PER_TILE + 1, count);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec2;

    fn setup(keys: &[u32]) -> (Arc<ComputeDevice>, TileRangeBuilder, TileGrid, CompositeKeyLayout, GpuBuffer, GpuBuffer) {
        let device = Arc::new(ComputeDevice::default());
        let builder = TileRangeBuilder::new(device.clone());
        let grid = TileGrid::new(UVec2::new(64, 32), 16).unwrap();
        let layout = CompositeKeyLayout::new(grid.tile_count(), Some(8)).unwrap();
        let sorted = device.create_buffer_init("sorted_keys", keys);
        let counters = device.create_buffer_init("counters", &[0, keys.len() as u32]);
        (device, builder, grid, layout, sorted, counters)
    }

    #[test]
    fn test_ranges_partition_sorted_entries() {
        let layout = CompositeKeyLayout::new(8, Some(8)).unwrap();
        let keys: Vec<u32> = [(0, 5), (0, 9), (2, 1), (5, 3), (5, 4), (5, 200), (7, 0)]
            .iter()
            .map(|&(tile, depth)| (tile << layout.depth_bits) | depth)
            .collect();
        let (_device, builder, grid, layout, sorted, counters) = setup(&keys);
        let ranges = builder.create_range_buffer(&grid);
        builder.build(&grid, &layout, &counters, 1, &sorted, &ranges).unwrap();

        let table = builder.read_ranges(&grid, &ranges);
        assert_eq!(table.len(), 8);
        assert_eq!(table[0], TileRange { start: 0, count: 2 });
        assert_eq!(table[1], TileRange::default());
        assert_eq!(table[2], TileRange { start: 2, count: 1 });
        assert_eq!(table[5], TileRange { start: 3, count: 3 });
        assert_eq!(table[7], TileRange { start: 6, count: 1 });
        assert_eq!(table.iter().map(|r| r.count).sum::<u32>(), 7);
        assert_eq!(load_range(&ranges, 5), table[5]);
    }

    #[test]
    fn test_single_tile_and_stale_ranges_cleared() {
        let keys = vec![3 << 8; 5];
        let (device, builder, grid, layout, sorted, counters) = setup(&keys);
        let ranges = builder.create_range_buffer(&grid);
        // garbage from a previous frame
        device.write_buffer(&ranges, 0, &[7, 9, 1, 4]);
        builder.build(&grid, &layout, &counters, 1, &sorted, &ranges).unwrap();

        let table = builder.read_ranges(&grid, &ranges);
        assert_eq!(table[3], TileRange { start: 0, count: 5 });
        assert!(table.iter().enumerate().all(|(t, r)| t == 3 || r.is_empty()));
    }

    #[test]
    fn test_zero_entries_leave_every_tile_empty() {
        let (device, builder, grid, layout, sorted, _) = setup(&[1 << 8, 2 << 8]);
        let counters = device.create_buffer("counters", 2);
        let ranges = builder.create_range_buffer(&grid);
        builder.build(&grid, &layout, &counters, 1, &sorted, &ranges).unwrap();
        assert!(builder.read_ranges(&grid, &ranges).iter().all(TileRange::is_empty));
    }
}
