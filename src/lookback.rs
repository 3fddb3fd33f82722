// Decoupled lookback slot
// One 32-bit word per (pass, partition, digit): the low two bits hold the
// publication state and the upper 30 bits the count. A partition first
// publishes its local digit count as a reduction, then promotes it to an
// inclusive prefix with a single atomic add once its own lookback resolved.

const STATE_MASK: u32 = 0b11;
const VALUE_SHIFT: u32 = 2;

/// Largest value a slot can carry.
pub const MAX_SLOT_VALUE: u32 = u32::MAX >> VALUE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookbackState {
    NotReady,
    /// Count of this digit inside one partition only.
    ReductionPublished(u32),
    /// Count of this digit in this partition and every partition before it,
    /// plus the digit's global base offset.
    InclusivePublished(u32),
}

impl LookbackState {
    const NOT_READY: u32 = 0;
    const REDUCTION: u32 = 1;
    const INCLUSIVE: u32 = 2;

    #[inline]
    pub fn pack(self) -> u32 {
        match self {
            Self::NotReady => Self::NOT_READY,
            Self::ReductionPublished(value) => (value << VALUE_SHIFT) | Self::REDUCTION,
            Self::InclusivePublished(value) => (value << VALUE_SHIFT) | Self::INCLUSIVE,
        }
    }

    #[inline]
    pub fn unpack(word: u32) -> Self {
        let value = word >> VALUE_SHIFT;
        match word & STATE_MASK {
            Self::REDUCTION => Self::ReductionPublished(value),
            Self::INCLUSIVE => Self::InclusivePublished(value),
            _ => Self::NotReady,
        }
    }

    /// Word to atomically add to a `ReductionPublished(count)` slot so it
    /// becomes `InclusivePublished(count + exclusive_prefix)`.
    #[inline]
    pub fn promotion(exclusive_prefix: u32) -> u32 {
        (exclusive_prefix << VALUE_SHIFT) | (Self::INCLUSIVE - Self::REDUCTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        for state in [
            LookbackState::NotReady,
            LookbackState::ReductionPublished(0),
            LookbackState::ReductionPublished(3840),
            LookbackState::InclusivePublished(0),
            LookbackState::InclusivePublished(MAX_SLOT_VALUE),
        ] {
            assert_eq!(LookbackState::unpack(state.pack()), state);
        }
        assert_eq!(LookbackState::unpack(0), LookbackState::NotReady);
    }

    #[test]
    fn test_promotion_by_atomic_add() {
        let slot = LookbackState::ReductionPublished(17).pack();
        let promoted = slot + LookbackState::promotion(1000);
        assert_eq!(LookbackState::unpack(promoted), LookbackState::InclusivePublished(1017));
    }

    #[test]
    fn test_max_sort_count_fits_in_a_slot() {
        assert!(crate::radix_sort::MAX_SORT_COUNT <= MAX_SLOT_VALUE);
    }
}
