// GPU Radix Sort
// Onesweep-style LSD radix sort over (key, payload) pairs: 8-bit digits,
// up to 4 passes for 32-bit keys.
// Stage 1: Init - zero histograms, lookback slots and partition counters
// Stage 2: GlobalHistogram - digit counts of every pass in one read of the keys
// Stage 3: Scan - digit counts -> global base offset of each digit
// Stage 4: DigitBinningPass x passes - local histogram, decoupled lookback,
//          scatter into the alternate buffer (buffers swap every pass)
//
// Every stage is its own dispatch, so each stage boundary is a device-wide
// barrier. Inside a digit-binning pass, partitions are ordered only by the
// lookback protocol (see lookback.rs).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::GpuBuffer;
use crate::device::{
    for_each_block, linear_workgroups, Capabilities, ComputeDevice, DispatchArgs, Kernel,
    WorkgroupId, Workgroups,
};
use crate::error::{ConfigurationError, Error, Result};
use crate::lookback::LookbackState;

pub const RADIX: usize = 256;
pub const RADIX_LOG: u32 = 8;
pub const RADIX_PASSES: usize = 4;
/// Keys handled by one workgroup in a digit-binning pass.
pub const PARTITION_SIZE: u32 = 3840;
/// Keys handled by one workgroup in the global histogram stage.
pub const GLOBAL_HIST_PARTITION_SIZE: u32 = 32768;
pub const MAX_PARTITIONS: u32 = 65535;
pub const MAX_SORT_COUNT: u32 = MAX_PARTITIONS * PARTITION_SIZE;

const INIT_ITEMS_PER_GROUP: u32 = 4096;

// Sort state words
const STATE_ELEMENT_COUNT: usize = 0;
const STATE_PARTITION_COUNT: usize = 1;
const STATE_PASS_INDEX: usize = 2;
const STATE_WORDS: usize = STATE_PASS_INDEX + RADIX_PASSES;

// Indirect argument offsets (in words) inside `SortScratch::indirect_args`
pub const ARGS_INIT: usize = 0;
pub const ARGS_GLOBAL_HIST: usize = DispatchArgs::WORDS;
pub const ARGS_BINNING: usize = 2 * DispatchArgs::WORDS;
pub const ARGS_COPY: usize = 3 * DispatchArgs::WORDS;
const ARGS_WORDS: usize = 4 * DispatchArgs::WORDS;

/// Digit passes needed to sort the low `bits` bits of a key.
pub fn passes_for_bits(bits: u32) -> u32 {
    bits.div_ceil(RADIX_LOG)
}

#[inline]
fn digit(key: u32, pass: u32) -> usize {
    ((key >> (pass * RADIX_LOG)) & (RADIX as u32 - 1)) as usize
}

/// Which physical buffer pair holds a sort result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultLocation {
    /// The caller's key/payload buffers
    Primary,
    /// The scratch `alt_keys` / `alt_payloads` buffers
    Alternate,
}

impl ResultLocation {
    /// Every pass scatters into the other buffer, so the parity of the pass
    /// count decides where the result ends up.
    pub fn after_passes(passes: u32) -> Self {
        if passes % 2 == 0 {
            Self::Primary
        } else {
            Self::Alternate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOutcome {
    pub passes: u32,
    pub location: ResultLocation,
}

impl SortOutcome {
    pub fn keys<'a>(&self, primary: &'a GpuBuffer, scratch: &'a SortScratch) -> &'a GpuBuffer {
        match self.location {
            ResultLocation::Primary => primary,
            ResultLocation::Alternate => &scratch.alt_keys,
        }
    }

    pub fn payloads<'a>(&self, primary: &'a GpuBuffer, scratch: &'a SortScratch) -> &'a GpuBuffer {
        match self.location {
            ResultLocation::Primary => primary,
            ResultLocation::Alternate => &scratch.alt_payloads,
        }
    }
}

/// Thread-block counts for one sort. Computed on the host for `sort` and by
/// the preparation kernel for `sort_indirect`; both use this same function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDispatchPlan {
    pub element_count: u32,
    pub partitions: u32,
    pub init: u32,
    pub global_histogram: u32,
    pub binning: u32,
    pub copy: u32,
}

impl SortDispatchPlan {
    pub fn for_count(count: u32) -> Self {
        let partitions = count.div_ceil(PARTITION_SIZE);
        Self {
            element_count: count,
            partitions,
            // group 0 also clears the global histogram and counters, so never 0
            init: linear_workgroups(init_items(partitions), INIT_ITEMS_PER_GROUP).max(1),
            global_histogram: count.div_ceil(GLOBAL_HIST_PARTITION_SIZE),
            binning: partitions,
            copy: linear_workgroups(count, PARTITION_SIZE),
        }
    }

    fn workgroups_at(&self, offset: usize) -> u32 {
        match offset {
            ARGS_INIT => self.init,
            ARGS_GLOBAL_HIST => self.global_histogram,
            ARGS_BINNING => self.binning,
            ARGS_COPY => self.copy,
            _ => 0,
        }
    }

    fn store(&self, state: &GpuBuffer, args: &GpuBuffer) {
        state.store(STATE_ELEMENT_COUNT, self.element_count);
        state.store(STATE_PARTITION_COUNT, self.partitions);
        for offset in [ARGS_INIT, ARGS_GLOBAL_HIST, ARGS_BINNING, ARGS_COPY] {
            args.write_record(
                offset / DispatchArgs::WORDS,
                &DispatchArgs::linear(self.workgroups_at(offset)),
            );
        }
    }
}

fn init_items(partitions: u32) -> u32 {
    RADIX_PASSES as u32 * partitions * RADIX as u32
}

fn partitions_for_capacity(capacity: u32) -> u32 {
    capacity.div_ceil(PARTITION_SIZE).max(1)
}

/// Scratch memory of one sort invocation. Borrowed mutably for the whole
/// sort, so two sorts can never share histogram or counter state.
pub struct SortScratch {
    alt_keys: GpuBuffer,
    alt_payloads: GpuBuffer,
    global_histogram: GpuBuffer,
    pass_histogram: GpuBuffer,
    state: GpuBuffer,
    indirect_args: GpuBuffer,
    capacity: u32,
    partition_stride: u32,
}

impl SortScratch {
    pub fn new(device: &ComputeDevice, capacity: u32) -> Self {
        let capacity = capacity.clamp(1, MAX_SORT_COUNT);
        let partition_stride = partitions_for_capacity(capacity);
        debug!(
            "Creating radix sort scratch: capacity {}, {} partitions",
            capacity, partition_stride
        );
        Self {
            alt_keys: device.create_buffer("radix_sort_alt_keys", capacity as usize),
            alt_payloads: device.create_buffer("radix_sort_alt_payloads", capacity as usize),
            global_histogram: device.create_buffer("radix_sort_global_histogram", RADIX * RADIX_PASSES),
            pass_histogram: device.create_buffer(
                "radix_sort_pass_histogram",
                RADIX * RADIX_PASSES * partition_stride as usize,
            ),
            state: device.create_buffer("radix_sort_state", STATE_WORDS),
            indirect_args: device.create_buffer("radix_sort_indirect_args", ARGS_WORDS),
            capacity,
            partition_stride,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Grows the scratch buffers when `count` does not fit. Returns true when
    /// buffers were reallocated (previous alternate contents are lost).
    pub fn ensure_capacity(&mut self, device: &ComputeDevice, count: u32) -> bool {
        if count <= self.capacity {
            return false;
        }
        *self = Self::new(device, count);
        true
    }

    pub fn alt_keys(&self) -> &GpuBuffer {
        &self.alt_keys
    }

    pub fn alt_payloads(&self) -> &GpuBuffer {
        &self.alt_payloads
    }

    /// The four `DispatchArgs` written by `prepare_indirect_dispatch`.
    pub fn indirect_args(&self) -> &GpuBuffer {
        &self.indirect_args
    }

    /// Element count the last prepared sort will process.
    pub fn element_count_word(&self) -> (&GpuBuffer, usize) {
        (&self.state, STATE_ELEMENT_COUNT)
    }
}

enum Launch<'a> {
    Host(SortDispatchPlan),
    Device(&'a GpuBuffer),
}

impl Launch<'_> {
    fn workgroups(&self, offset: usize) -> Workgroups<'_> {
        match self {
            Launch::Host(plan) => Workgroups::Direct(plan.workgroups_at(offset)),
            Launch::Device(args) => Workgroups::Indirect { args: *args, offset },
        }
    }
}

pub struct RadixSorter {
    device: Arc<ComputeDevice>,
    configuration_error: Option<ConfigurationError>,
}

impl RadixSorter {
    pub fn new(device: Arc<ComputeDevice>) -> Self {
        let configuration_error = Capabilities::check(device.profile()).err();
        if let Some(err) = &configuration_error {
            warn!("Radix sorter disabled on '{}': {}", device.profile().name, err);
        }
        Self {
            device,
            configuration_error,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.configuration_error.is_none()
    }

    pub fn configuration_error(&self) -> Option<&ConfigurationError> {
        self.configuration_error.as_ref()
    }

    pub fn device(&self) -> &Arc<ComputeDevice> {
        &self.device
    }

    pub fn create_scratch(&self, capacity: u32) -> SortScratch {
        SortScratch::new(&self.device, capacity)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::Invalid("radix sorter"))
        }
    }

    /// Sorts `count` pairs ascending by key. The count is known on the host.
    /// Always runs 4 passes, so the result lands back in `keys`/`payloads`.
    pub fn sort(
        &self,
        count: u32,
        keys: &GpuBuffer,
        payloads: &GpuBuffer,
        scratch: &mut SortScratch,
    ) -> Result<SortOutcome> {
        self.ensure_valid()?;
        if count == 0 || count > MAX_SORT_COUNT {
            return Err(Error::InvalidCount {
                count,
                max: MAX_SORT_COUNT,
            });
        }
        let available = keys.len().min(payloads.len());
        if count as usize > available {
            return Err(Error::CapacityExceeded {
                what: "sort key/payload buffers",
                required: count as usize,
                capacity: available,
            });
        }

        let _span = tracing::trace_span!("Radix sort", count).entered();
        scratch.ensure_capacity(&self.device, count);

        let plan = SortDispatchPlan::for_count(count);
        self.device
            .write_buffer(&scratch.state, 0, &[plan.element_count, plan.partitions]);
        Ok(self.record_stages(
            &Launch::Host(plan),
            keys,
            payloads,
            scratch,
            RADIX_PASSES as u32,
            false,
        ))
    }

    /// Sorts pairs whose count lives on the device at `count_buffer[count_offset]`.
    /// Only the low `bits` bits of each key are sorted. When the pass count is
    /// odd the result sits in the scratch buffers unless `copy_if_odd_passes`.
    #[allow(clippy::too_many_arguments)]
    pub fn sort_indirect(
        &self,
        count_buffer: &GpuBuffer,
        count_offset: usize,
        keys: &GpuBuffer,
        payloads: &GpuBuffer,
        scratch: &mut SortScratch,
        bits: u32,
        copy_if_odd_passes: bool,
    ) -> Result<SortOutcome> {
        if !(1..=32).contains(&bits) {
            return Err(Error::InvalidKeyBits(bits));
        }
        let _span = tracing::trace_span!("Radix sort (indirect)", bits).entered();
        self.prepare_indirect_dispatch(count_buffer, count_offset, keys, payloads, scratch)?;
        self.dispatch_sorted(keys, payloads, scratch, bits, copy_if_odd_passes)
    }

    /// Phase one of an indirect sort: reads the device-side count (clamped to
    /// what the buffers hold) and writes the thread-block counts of every
    /// later stage into `scratch.indirect_args()`.
    pub fn prepare_indirect_dispatch(
        &self,
        count_buffer: &GpuBuffer,
        count_offset: usize,
        keys: &GpuBuffer,
        payloads: &GpuBuffer,
        scratch: &mut SortScratch,
    ) -> Result<()> {
        self.ensure_valid()?;
        let capacity = keys.len().min(payloads.len()).min(MAX_SORT_COUNT as usize);
        if capacity == 0 {
            return Err(Error::CapacityExceeded {
                what: "sort key/payload buffers",
                required: 1,
                capacity: 0,
            });
        }
        let capacity = capacity as u32;
        scratch.ensure_capacity(&self.device, capacity);

        self.device.dispatch(
            &PrepareIndirectKernel {
                count: count_buffer,
                count_offset,
                capacity,
                state: &scratch.state,
                args: &scratch.indirect_args,
            },
            Workgroups::Direct(1),
        );
        Ok(())
    }

    /// Phase two of an indirect sort: every stage dispatched from the
    /// arguments written by `prepare_indirect_dispatch`.
    pub fn dispatch_sorted(
        &self,
        keys: &GpuBuffer,
        payloads: &GpuBuffer,
        scratch: &mut SortScratch,
        bits: u32,
        copy_if_odd_passes: bool,
    ) -> Result<SortOutcome> {
        self.ensure_valid()?;
        if !(1..=32).contains(&bits) {
            return Err(Error::InvalidKeyBits(bits));
        }
        let scratch: &SortScratch = scratch;
        Ok(self.record_stages(
            &Launch::Device(&scratch.indirect_args),
            keys,
            payloads,
            scratch,
            passes_for_bits(bits),
            copy_if_odd_passes,
        ))
    }

    fn record_stages(
        &self,
        launch: &Launch<'_>,
        keys: &GpuBuffer,
        payloads: &GpuBuffer,
        scratch: &SortScratch,
        passes: u32,
        copy_if_odd_passes: bool,
    ) -> SortOutcome {
        let device = &self.device;
        let stride = scratch.partition_stride;

        device.dispatch(
            &InitKernel {
                global_histogram: &scratch.global_histogram,
                pass_histogram: &scratch.pass_histogram,
                state: &scratch.state,
                partition_stride: stride,
            },
            launch.workgroups(ARGS_INIT),
        );

        device.dispatch(
            &GlobalHistogramKernel {
                keys,
                global_histogram: &scratch.global_histogram,
                state: &scratch.state,
                passes,
            },
            launch.workgroups(ARGS_GLOBAL_HIST),
        );

        device.dispatch(
            &ScanKernel {
                global_histogram: &scratch.global_histogram,
                pass_histogram: &scratch.pass_histogram,
                partition_stride: stride,
            },
            Workgroups::Direct(passes),
        );

        for pass in 0..passes {
            let (src_keys, src_payloads, dst_keys, dst_payloads) = if pass % 2 == 0 {
                (keys, payloads, &scratch.alt_keys, &scratch.alt_payloads)
            } else {
                (&scratch.alt_keys, &scratch.alt_payloads, keys, payloads)
            };
            device.dispatch(
                &DigitBinningKernel {
                    src_keys,
                    src_payloads,
                    dst_keys,
                    dst_payloads,
                    pass_histogram: &scratch.pass_histogram,
                    state: &scratch.state,
                    pass,
                    partition_stride: stride,
                },
                launch.workgroups(ARGS_BINNING),
            );
        }

        let mut location = ResultLocation::after_passes(passes);
        if copy_if_odd_passes && location == ResultLocation::Alternate {
            device.dispatch(
                &CopyKernel {
                    src_keys: &scratch.alt_keys,
                    src_payloads: &scratch.alt_payloads,
                    dst_keys: keys,
                    dst_payloads: payloads,
                    state: &scratch.state,
                },
                launch.workgroups(ARGS_COPY),
            );
            location = ResultLocation::Primary;
        }

        SortOutcome { passes, location }
    }
}

#[inline]
fn slot_index(pass: u32, partition: u32, digit: usize, stride: u32) -> usize {
    (pass as usize * stride as usize + partition as usize) * RADIX + digit
}

struct PrepareIndirectKernel<'a> {
    count: &'a GpuBuffer,
    count_offset: usize,
    capacity: u32,
    state: &'a GpuBuffer,
    args: &'a GpuBuffer,
}

impl Kernel for PrepareIndirectKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_prepare_indirect"
    }

    fn execute(&self, group: WorkgroupId) {
        if group.index != 0 {
            return;
        }
        let count = self.count.atomic_load(self.count_offset).min(self.capacity);
        SortDispatchPlan::for_count(count).store(self.state, self.args);
    }
}

struct InitKernel<'a> {
    global_histogram: &'a GpuBuffer,
    pass_histogram: &'a GpuBuffer,
    state: &'a GpuBuffer,
    partition_stride: u32,
}

impl Kernel for InitKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_init"
    }

    fn execute(&self, group: WorkgroupId) {
        let partitions = self.state.load(STATE_PARTITION_COUNT);
        if group.index == 0 {
            for i in 0..RADIX * RADIX_PASSES {
                self.global_histogram.store(i, 0);
            }
            for pass in 0..RADIX_PASSES {
                self.state.store(STATE_PASS_INDEX + pass, 0);
            }
        }

        let per_pass = partitions * RADIX as u32;
        let stride_words = self.partition_stride as usize * RADIX;
        for_each_block(group, init_items(partitions), INIT_ITEMS_PER_GROUP, |range| {
            for i in range {
                let pass = (i / per_pass) as usize;
                let rem = (i % per_pass) as usize;
                self.pass_histogram.store(pass * stride_words + rem, 0);
            }
        });
    }
}

struct GlobalHistogramKernel<'a> {
    keys: &'a GpuBuffer,
    global_histogram: &'a GpuBuffer,
    state: &'a GpuBuffer,
    passes: u32,
}

impl Kernel for GlobalHistogramKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_global_histogram"
    }

    fn execute(&self, group: WorkgroupId) {
        let count = self.state.load(STATE_ELEMENT_COUNT);
        for_each_block(group, count, GLOBAL_HIST_PARTITION_SIZE, |range| {
            // workgroup-shared histogram, one row per pass
            let mut local = [[0u32; RADIX]; RADIX_PASSES];
            for i in range {
                let key = self.keys.load(i as usize);
                for pass in 0..self.passes {
                    local[pass as usize][digit(key, pass)] += 1;
                }
            }
            for (pass, row) in local.iter().enumerate().take(self.passes as usize) {
                for (d, &c) in row.iter().enumerate() {
                    if c != 0 {
                        self.global_histogram.atomic_add(pass * RADIX + d, c);
                    }
                }
            }
        });
    }
}

/// One workgroup per pass, one lane per digit.
struct ScanKernel<'a> {
    global_histogram: &'a GpuBuffer,
    pass_histogram: &'a GpuBuffer,
    partition_stride: u32,
}

impl Kernel for ScanKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_scan"
    }

    fn execute(&self, group: WorkgroupId) {
        let pass = group.index;
        let mut prefix = 0u32;
        for d in 0..RADIX {
            let count = self.global_histogram.load(pass as usize * RADIX + d);
            self.pass_histogram.atomic_store(
                slot_index(pass, 0, d, self.partition_stride),
                LookbackState::InclusivePublished(prefix).pack(),
            );
            prefix += count;
        }
    }
}

struct DigitBinningKernel<'a> {
    src_keys: &'a GpuBuffer,
    src_payloads: &'a GpuBuffer,
    dst_keys: &'a GpuBuffer,
    dst_payloads: &'a GpuBuffer,
    pass_histogram: &'a GpuBuffer,
    state: &'a GpuBuffer,
    pass: u32,
    partition_stride: u32,
}

impl DigitBinningKernel<'_> {
    #[inline]
    fn slot(&self, partition: u32, digit: usize) -> usize {
        slot_index(self.pass, partition, digit, self.partition_stride)
    }

    /// Walks predecessor slots until an inclusive one, summing reductions.
    /// Slot 0 is always inclusive (written by the scan stage).
    fn lookback(&self, partition: u32, digit: usize) -> u32 {
        let mut prefix = 0u32;
        let mut k = partition;
        let mut spins = 0u32;
        loop {
            let word = self.pass_histogram.atomic_load(self.slot(k, digit));
            match LookbackState::unpack(word) {
                LookbackState::InclusivePublished(value) => return prefix + value,
                LookbackState::ReductionPublished(value) => {
                    prefix += value;
                    k = k.saturating_sub(1);
                    spins = 0;
                }
                LookbackState::NotReady => {
                    // predecessor claimed its partition but has not published yet
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

impl Kernel for DigitBinningKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_digit_binning"
    }

    fn execute(&self, _group: WorkgroupId) {
        let count = self.state.load(STATE_ELEMENT_COUNT);
        let partitions = self.state.load(STATE_PARTITION_COUNT);

        // Partitions are claimed in launch order, so every predecessor this
        // workgroup waits on is already running.
        let partition = self
            .state
            .atomic_add(STATE_PASS_INDEX + self.pass as usize, 1);
        if partition >= partitions {
            return;
        }

        let start = partition * PARTITION_SIZE;
        let end = (start + PARTITION_SIZE).min(count);
        let keys: Vec<u32> = (start..end).map(|i| self.src_keys.load(i as usize)).collect();

        let mut histogram = [0u32; RADIX];
        for &key in &keys {
            histogram[digit(key, self.pass)] += 1;
        }

        let publishes = partition + 1 < partitions;
        if publishes {
            for (d, &c) in histogram.iter().enumerate() {
                self.pass_histogram.atomic_add(
                    self.slot(partition + 1, d),
                    LookbackState::ReductionPublished(c).pack(),
                );
            }
        }

        let mut offsets = [0u32; RADIX];
        for (d, offset) in offsets.iter_mut().enumerate() {
            let exclusive = self.lookback(partition, d);
            if publishes {
                self.pass_histogram
                    .atomic_add(self.slot(partition + 1, d), LookbackState::promotion(exclusive));
            }
            *offset = exclusive;
        }

        for (j, &key) in keys.iter().enumerate() {
            let d = digit(key, self.pass);
            let dst = offsets[d] as usize;
            offsets[d] += 1;
            self.dst_keys.store(dst, key);
            self.dst_payloads
                .store(dst, self.src_payloads.load(start as usize + j));
        }
    }
}

struct CopyKernel<'a> {
    src_keys: &'a GpuBuffer,
    src_payloads: &'a GpuBuffer,
    dst_keys: &'a GpuBuffer,
    dst_payloads: &'a GpuBuffer,
    state: &'a GpuBuffer,
}

impl Kernel for CopyKernel<'_> {
    fn label(&self) -> &'static str {
        "radix_sort_copy"
    }

    fn execute(&self, group: WorkgroupId) {
        let count = self.state.load(STATE_ELEMENT_COUNT);
        for_each_block(group, count, PARTITION_SIZE, |range| {
            for i in range {
                let i = i as usize;
                self.dst_keys.store(i, self.src_keys.load(i));
                self.dst_payloads.store(i, self.src_payloads.load(i));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;

    #[test]
    fn test_dispatch_plan_boundaries() {
        let plan = SortDispatchPlan::for_count(PARTITION_SIZE);
        assert_eq!(plan.partitions, 1);
        assert_eq!(plan.binning, 1);
        assert_eq!(plan.global_histogram, 1);

        let plan = SortDispatchPlan::for_count(PARTITION_SIZE + 1);
        assert_eq!(plan.partitions, 2);

        let plan = SortDispatchPlan::for_count(MAX_SORT_COUNT);
        assert_eq!(plan.partitions, MAX_PARTITIONS);
        assert_eq!(plan.global_histogram, MAX_SORT_COUNT.div_ceil(GLOBAL_HIST_PARTITION_SIZE));

        let plan = SortDispatchPlan::for_count(0);
        assert_eq!(plan.binning, 0);
        assert_eq!(plan.init, 1);
    }

    #[test]
    fn test_passes_and_result_location() {
        assert_eq!(passes_for_bits(32), 4);
        assert_eq!(passes_for_bits(24), 3);
        assert_eq!(passes_for_bits(17), 3);
        assert_eq!(passes_for_bits(16), 2);
        assert_eq!(passes_for_bits(1), 1);
        assert_eq!(ResultLocation::after_passes(4), ResultLocation::Primary);
        assert_eq!(ResultLocation::after_passes(3), ResultLocation::Alternate);
    }

    #[test]
    fn test_invalid_sorter_refuses_to_dispatch() {
        let device = Arc::new(ComputeDevice::new(DeviceProfile::downlevel_webgl2()));
        let sorter = RadixSorter::new(device.clone());
        assert!(!sorter.is_valid());
        assert!(sorter.configuration_error().is_some());

        let keys = device.create_buffer_init("keys", &[3, 1, 2]);
        let payloads = device.create_buffer_init("payloads", &[0, 1, 2]);
        let mut scratch = sorter.create_scratch(3);
        assert!(matches!(
            sorter.sort(3, &keys, &payloads, &mut scratch),
            Err(Error::Invalid(_))
        ));
        // untouched
        assert_eq!(device.read_buffer(&keys), vec![3, 1, 2]);
    }

    #[test]
    fn test_count_validation() {
        let device = Arc::new(ComputeDevice::default());
        let sorter = RadixSorter::new(device.clone());
        let keys = device.create_buffer("keys", 4);
        let payloads = device.create_buffer("payloads", 4);
        let mut scratch = sorter.create_scratch(4);

        assert!(matches!(
            sorter.sort(0, &keys, &payloads, &mut scratch),
            Err(Error::InvalidCount { .. })
        ));
        assert!(matches!(
            sorter.sort(MAX_SORT_COUNT + 1, &keys, &payloads, &mut scratch),
            Err(Error::InvalidCount { .. })
        ));
        assert!(matches!(
            sorter.sort(5, &keys, &payloads, &mut scratch),
            Err(Error::CapacityExceeded { required: 5, capacity: 4, .. })
        ));
        assert!(matches!(
            sorter.sort_indirect(&keys, 0, &keys, &payloads, &mut scratch, 33, false),
            Err(Error::InvalidKeyBits(33))
        ));
    }

    #[test]
    fn test_small_sort_in_place() {
        let device = Arc::new(ComputeDevice::default());
        let sorter = RadixSorter::new(device.clone());
        let keys = device.create_buffer_init("keys", &[0xdead_beef, 7, 0, 7, u32::MAX, 256]);
        let payloads = device.create_buffer_init("payloads", &[0, 1, 2, 3, 4, 5]);
        let mut scratch = sorter.create_scratch(6);

        let outcome = sorter.sort(6, &keys, &payloads, &mut scratch).unwrap();
        assert_eq!(outcome.passes, 4);
        assert_eq!(outcome.location, ResultLocation::Primary);
        assert_eq!(device.read_buffer(&keys), vec![0, 7, 7, 256, 0xdead_beef, u32::MAX]);
        // equal keys keep input order on this device
        assert_eq!(device.read_buffer(&payloads), vec![2, 1, 3, 5, 0, 4]);
    }

    #[test]
    fn test_scratch_grows_on_demand() {
        let device = Arc::new(ComputeDevice::default());
        let sorter = RadixSorter::new(device.clone());
        let mut scratch = sorter.create_scratch(16);
        let n = PARTITION_SIZE * 2 + 5;
        let data: Vec<u32> = (0..n).rev().collect();
        let keys = device.create_buffer_init("keys", &data);
        let payloads = device.create_buffer_init("payloads", &data);

        sorter.sort(n, &keys, &payloads, &mut scratch).unwrap();
        assert!(scratch.capacity() >= n);
        let sorted = device.read_buffer(&keys);
        assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
    }
}
