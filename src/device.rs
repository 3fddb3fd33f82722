// Compute device
// Executes workgroup programs ("kernels") over device buffers with the same
// ordering rules as a single GPU command stream:
// - dispatches run strictly in submission order
// - every dispatch sees all writes of the dispatches recorded before it
// - workgroups inside one dispatch run concurrently and may only talk to each
//   other through atomics (the radix sort lookback is the one place we do)
//
// Workgroups are scheduled on the rayon pool. A workgroup body runs its lanes
// in lane order, so shared-memory phases are separated the same way a
// workgroupBarrier() would separate them.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::buffer::GpuBuffer;
use crate::error::ConfigurationError;

/// Largest workgroup count accepted per dispatch dimension by the sorter.
pub const REQUIRED_WORKGROUPS_PER_DIMENSION: u32 = 65535;
/// Lanes per workgroup used by every kernel in the crate.
pub const REQUIRED_INVOCATIONS_PER_WORKGROUP: u32 = 256;
/// One digit-binning partition (3840 keys) plus a 256-bin digit histogram.
pub const REQUIRED_WORKGROUP_STORAGE_BYTES: u32 = 3840 * 4 + 256 * 4;
/// src/dst keys, src/dst payloads, lookback histograms, sort state
pub const REQUIRED_STORAGE_BUFFERS_PER_STAGE: u32 = 6;

/// Limits and feature flags of the device the engine runs on.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: String,
    pub limits: wgpu::Limits,
    pub downlevel: wgpu::DownlevelFlags,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "software compute device".to_string(),
            limits: wgpu::Limits::default(),
            downlevel: wgpu::DownlevelFlags::all(),
        }
    }
}

impl DeviceProfile {
    /// WebGL2-class device: no compute shaders, no storage buffers.
    pub fn downlevel_webgl2() -> Self {
        Self {
            name: "webgl2 downlevel device".to_string(),
            limits: wgpu::Limits::downlevel_webgl2_defaults(),
            downlevel: wgpu::DownlevelFlags::empty(),
        }
    }

    /// Query the limits of the system's default adapter.
    /// Blocks on adapter creation; call once at startup.
    #[cfg(feature = "native")]
    pub fn probe() -> Result<Self, ConfigurationError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(
            instance.request_adapter(&wgpu::RequestAdapterOptions::default()),
        )
        .map_err(|_| ConfigurationError::NoAdapter)?;

        let info = adapter.get_info();
        let profile = Self {
            name: format!("{} ({:?})", info.name, info.backend),
            limits: adapter.limits(),
            downlevel: adapter.get_downlevel_capabilities().flags,
        };
        info!("Probed adapter: {}", profile.name);
        Ok(profile)
    }
}

/// Static capability check shared by every component.
pub struct Capabilities;

impl Capabilities {
    pub fn check(profile: &DeviceProfile) -> Result<(), ConfigurationError> {
        for flag in [
            wgpu::DownlevelFlags::COMPUTE_SHADERS,
            wgpu::DownlevelFlags::INDIRECT_EXECUTION,
        ] {
            if !profile.downlevel.contains(flag) {
                return Err(ConfigurationError::MissingCapability(flag));
            }
        }

        let limits = &profile.limits;
        let checks: [(&'static str, u32, u32); 4] = [
            (
                "max_compute_workgroups_per_dimension",
                REQUIRED_WORKGROUPS_PER_DIMENSION,
                limits.max_compute_workgroups_per_dimension,
            ),
            (
                "max_compute_invocations_per_workgroup",
                REQUIRED_INVOCATIONS_PER_WORKGROUP,
                limits.max_compute_invocations_per_workgroup,
            ),
            (
                "max_compute_workgroup_storage_size",
                REQUIRED_WORKGROUP_STORAGE_BYTES,
                limits.max_compute_workgroup_storage_size,
            ),
            (
                "max_storage_buffers_per_shader_stage",
                REQUIRED_STORAGE_BUFFERS_PER_STAGE,
                limits.max_storage_buffers_per_shader_stage,
            ),
        ];

        for (limit, required, available) in checks {
            if available < required {
                return Err(ConfigurationError::LimitTooLow {
                    limit,
                    required: required as u64,
                    available: available as u64,
                });
            }
        }
        Ok(())
    }
}

/// Position of a workgroup inside its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupId {
    pub index: u32,
    pub count: u32,
}

/// A workgroup program.
pub trait Kernel: Sync {
    fn label(&self) -> &'static str;

    /// Runs one workgroup to completion.
    fn execute(&self, group: WorkgroupId);
}

/// Workgroup count of a dispatch.
#[derive(Debug, Clone, Copy)]
pub enum Workgroups<'a> {
    /// Count known by the host when the dispatch is recorded.
    Direct(u32),
    /// Count read from `args[offset]` (the `x` of a `DispatchArgs`) when the dispatch runs.
    Indirect { args: &'a GpuBuffer, offset: usize },
}

/// Indirect dispatch arguments (matches `wgpu::util::DispatchIndirectArgs`).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchArgs {
    pub const WORDS: usize = 3;

    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

/// Indirect draw arguments (matches `wgpu::util::DrawIndirectArgs`).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Workgroups needed to cover `count` items at `per_group` items each,
/// capped to what one dispatch dimension allows. Kernels stride over the
/// remaining blocks (see [`for_each_block`]).
pub fn linear_workgroups(count: u32, per_group: u32) -> u32 {
    count
        .div_ceil(per_group)
        .min(REQUIRED_WORKGROUPS_PER_DIMENSION)
}

/// Grid-stride loop over `[0, count)` in blocks of `per_group` items.
pub fn for_each_block(
    group: WorkgroupId,
    count: u32,
    per_group: u32,
    mut f: impl FnMut(std::ops::Range<u32>),
) {
    let blocks = count.div_ceil(per_group);
    let mut block = group.index;
    while block < blocks {
        let start = block * per_group;
        let end = (start + per_group).min(count);
        f(start..end);
        block += group.count.max(1);
    }
}

/// The device: buffer factory plus an in-order dispatch queue.
#[derive(Debug)]
pub struct ComputeDevice {
    profile: DeviceProfile,
}

impl ComputeDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        info!(
            "Compute device '{}': {} workgroups/dim, {} B workgroup storage",
            profile.name,
            profile.limits.max_compute_workgroups_per_dimension,
            profile.limits.max_compute_workgroup_storage_size
        );
        Self { profile }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn create_buffer(&self, label: &str, len: usize) -> GpuBuffer {
        debug!("Creating buffer '{}' ({} words)", label, len);
        GpuBuffer::zeroed(label, len)
    }

    pub fn create_buffer_init(&self, label: &str, contents: &[u32]) -> GpuBuffer {
        debug!("Creating buffer '{}' ({} words, initialized)", label, contents.len());
        GpuBuffer::from_words(label, contents)
    }

    pub fn create_buffer_from_records<T: bytemuck::Pod>(&self, label: &str, records: &[T]) -> GpuBuffer {
        let buffer = self.create_buffer(label, records.len() * crate::buffer::record_words::<T>());
        for (i, record) in records.iter().enumerate() {
            buffer.write_record(i, record);
        }
        buffer
    }

    /// Queue write. Lands before any dispatch recorded after it.
    pub fn write_buffer(&self, buffer: &GpuBuffer, offset: usize, data: &[u32]) {
        for (i, &word) in data.iter().enumerate() {
            buffer.store(offset + i, word);
        }
    }

    pub fn clear_buffer(&self, buffer: &GpuBuffer) {
        buffer.fill(0);
    }

    pub fn copy_buffer_to_buffer(
        &self,
        src: &GpuBuffer,
        src_offset: usize,
        dst: &GpuBuffer,
        dst_offset: usize,
        len: usize,
    ) {
        for i in 0..len {
            dst.store(dst_offset + i, src.load(src_offset + i));
        }
    }

    /// Host readback. This is a full host/device sync point.
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> Vec<u32> {
        buffer.snapshot()
    }

    pub fn read_records<T: bytemuck::Pod>(&self, buffer: &GpuBuffer, count: usize) -> Vec<T> {
        (0..count).map(|i| buffer.read_record(i)).collect()
    }

    /// Runs `kernel` over the requested workgroups. Returns once every
    /// workgroup has finished, which is the barrier the next dispatch relies on.
    pub fn dispatch<K: Kernel>(&self, kernel: &K, workgroups: Workgroups<'_>) {
        let count = match workgroups {
            Workgroups::Direct(count) => count,
            Workgroups::Indirect { args, offset } => args.atomic_load(offset),
        };
        let max = self.profile.limits.max_compute_workgroups_per_dimension;
        if count > max {
            warn!(
                "Rejected dispatch '{}': {} workgroups exceeds device limit {}",
                kernel.label(),
                count,
                max
            );
            return;
        }
        if count == 0 {
            return;
        }

        let _span = tracing::trace_span!("dispatch", kernel = kernel.label(), workgroups = count).entered();
        (0..count)
            .into_par_iter()
            .for_each(|index| kernel.execute(WorkgroupId { index, count }));
    }
}

impl Default for ComputeDevice {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}
