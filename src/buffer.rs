// Device storage buffers
// Every buffer is an array of 32-bit words. Structured records are laid out
// as consecutive words, the same way a WGSL `array<u32>` binding would see them.
//
// Access follows WebGPU robust buffer access: out-of-bounds loads read 0,
// out-of-bounds stores and atomics are dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

/// Handle to a device storage buffer. Cloning aliases the same storage.
#[derive(Clone)]
pub struct GpuBuffer {
    label: Arc<str>,
    words: Arc<[AtomicU32]>,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.label)
            .field("len", &self.words.len())
            .finish()
    }
}

impl GpuBuffer {
    pub(crate) fn zeroed(label: &str, len: usize) -> Self {
        let words: Arc<[AtomicU32]> = (0..len).map(|_| AtomicU32::new(0)).collect();
        Self {
            label: Arc::from(label),
            words,
        }
    }

    pub(crate) fn from_words(label: &str, data: &[u32]) -> Self {
        let words: Arc<[AtomicU32]> = data.iter().map(|&w| AtomicU32::new(w)).collect();
        Self {
            label: Arc::from(label),
            words,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Length in 32-bit words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// True when both handles refer to the same physical buffer.
    pub fn same_buffer(&self, other: &GpuBuffer) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.words
            .get(index)
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        if let Some(w) = self.words.get(index) {
            w.store(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load(index))
    }

    #[inline]
    pub fn store_f32(&self, index: usize, value: f32) {
        self.store(index, value.to_bits());
    }

    /// `atomicAdd`. Returns the previous value (0 when out of bounds).
    #[inline]
    pub fn atomic_add(&self, index: usize, value: u32) -> u32 {
        self.words
            .get(index)
            .map_or(0, |w| w.fetch_add(value, Ordering::AcqRel))
    }

    /// `atomicLoad` with acquire ordering, used for cross-workgroup polling.
    #[inline]
    pub fn atomic_load(&self, index: usize) -> u32 {
        self.words
            .get(index)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    #[inline]
    pub fn atomic_store(&self, index: usize, value: u32) {
        if let Some(w) = self.words.get(index) {
            w.store(value, Ordering::Release);
        }
    }

    /// Reads the `index`-th record of type `T` (records are packed back to back).
    pub fn read_record<T: Pod>(&self, index: usize) -> T {
        let stride = record_words::<T>();
        let base = index * stride;
        let mut value = T::zeroed();
        for (w, chunk) in bytemuck::bytes_of_mut(&mut value)
            .chunks_exact_mut(4)
            .enumerate()
        {
            chunk.copy_from_slice(&self.load(base + w).to_ne_bytes());
        }
        value
    }

    /// Writes the `index`-th record of type `T`.
    pub fn write_record<T: Pod>(&self, index: usize, value: &T) {
        let stride = record_words::<T>();
        let base = index * stride;
        for (w, chunk) in bytemuck::bytes_of(value).chunks_exact(4).enumerate() {
            let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.store(base + w, word);
        }
    }

    pub(crate) fn fill(&self, value: u32) {
        for w in self.words.iter() {
            w.store(value, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u32> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }
}

/// Number of 32-bit words a `Pod` record occupies.
pub const fn record_words<T: Pod>() -> usize {
    std::mem::size_of::<T>().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Pair {
        a: u32,
        b: f32,
    }

    #[test]
    fn test_out_of_bounds_access_is_robust() {
        let buffer = GpuBuffer::zeroed("oob", 4);
        buffer.store(10, 7);
        assert_eq!(buffer.load(10), 0);
        assert_eq!(buffer.atomic_add(10, 1), 0);
        assert_eq!(buffer.snapshot(), vec![0; 4]);
    }

    #[test]
    fn test_record_round_trip() {
        let buffer = GpuBuffer::zeroed("records", 6);
        let pair = Pair { a: 42, b: -1.5 };
        buffer.write_record(1, &pair);
        assert_eq!(buffer.read_record::<Pair>(1), pair);
        assert_eq!(buffer.load(2), 42);
        assert_eq!(buffer.load(0), 0);
    }

    #[test]
    fn test_clones_alias_storage() {
        let a = GpuBuffer::zeroed("a", 2);
        let b = a.clone();
        b.store(1, 5);
        assert_eq!(a.load(1), 5);
        assert!(a.same_buffer(&b));
        assert!(!a.same_buffer(&GpuBuffer::zeroed("c", 2)));
    }
}
