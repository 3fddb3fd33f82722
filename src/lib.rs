// Gaussian splat sort and tile binning engine
// Onesweep radix sort plus the projection, tile binning, tile range and
// tile rasterization stages built on it, running on an in-order compute
// device model.

pub mod buffer;
pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod float_key;
pub mod gaussian_splats;
pub mod lookback;
pub mod pipeline;
pub mod radix_sort;
pub mod registry;
pub mod sh;
pub mod splat_state;
pub mod temporal_coherence;
pub mod tile_binner;
pub mod tile_rasterizer;
pub mod tile_ranges;
pub mod view_projector;

// Re-exports
pub use buffer::GpuBuffer;
pub use camera::ViewCamera;
pub use config::{PipelineConfig, ProjectionConfig, SortConfig, TileConfig};
pub use device::{Capabilities, ComputeDevice, DeviceProfile, DispatchArgs, DrawArgs, Kernel, WorkgroupId, Workgroups};
pub use error::{ConfigurationError, Error, Result};
pub use float_key::{depth_sort_key, float_to_sortable_uint, sortable_uint_to_float, SortOrder};
pub use gaussian_splats::{create_test_splats, inverse_sigmoid, sigmoid, GaussianSplats, PackedSplat, SplatBuffers};
pub use pipeline::{FrameStats, QuadFrame, SplatSortPipeline, TileFrame};
pub use radix_sort::{RadixSorter, ResultLocation, SortOutcome, SortScratch, MAX_SORT_COUNT, PARTITION_SIZE};
pub use registry::{Registration, RenderEntry, RenderRegistry, SharedRenderState};
pub use splat_state::{state_bits, SelectionOp, SplatState};
pub use temporal_coherence::{should_skip_sorting, TemporalCoherenceCache, TemporalCoherenceConfig, TemporalCoherenceStats};
pub use tile_binner::{CompositeKeyLayout, TileBinner, TileGrid, TileSpan};
pub use tile_rasterizer::TileRasterizer;
pub use tile_ranges::{TileRange, TileRangeBuilder};
pub use view_projector::{ProjectionMode, ProjectionTargets, ViewProjector, ViewRecord};
