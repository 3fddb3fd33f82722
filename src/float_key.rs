// Radix-sortable float keys
// IEEE-754 floats compare like sign-magnitude integers. Flipping the sign bit
// of positives and every bit of negatives turns them into plain unsigned
// integers with the same order.

/// Draw order a depth key encodes when sorted ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Nearest first (ascending depth)
    FrontToBack,
    /// Farthest first (descending depth), the order "over" blending expects
    #[default]
    BackToFront,
}

#[inline]
pub fn float_to_sortable_uint(f: f32) -> u32 {
    let bits = f.to_bits();
    let mask = (-((bits >> 31) as i32)) as u32 | 0x8000_0000;
    bits ^ mask
}

#[inline]
pub fn sortable_uint_to_float(u: u32) -> f32 {
    let mask = (u >> 31).wrapping_sub(1) | 0x8000_0000;
    f32::from_bits(u ^ mask)
}

/// Sort key for a camera-space depth under the given order.
#[inline]
pub fn depth_sort_key(depth: f32, order: SortOrder) -> u32 {
    let key = float_to_sortable_uint(depth);
    match order {
        SortOrder::FrontToBack => key,
        SortOrder::BackToFront => !key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_round_trip_random_bits() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..100_000 {
            let f = f32::from_bits(rng.gen());
            if f.is_nan() {
                continue;
            }
            let back = sortable_uint_to_float(float_to_sortable_uint(f));
            assert_eq!(back.to_bits(), f.to_bits(), "round trip failed for {f:e}");
        }
    }

    #[test]
    fn test_round_trip_special_values() {
        for f in [
            0.0f32,
            -0.0,
            f32::MIN_POSITIVE,
            -f32::MIN_POSITIVE,
            f32::from_bits(1),
            -f32::from_bits(1),
            f32::MAX,
            f32::MIN,
            f32::INFINITY,
            f32::NEG_INFINITY,
        ] {
            assert_eq!(sortable_uint_to_float(float_to_sortable_uint(f)).to_bits(), f.to_bits());
        }
    }

    #[test]
    fn test_order_preserved_across_zero() {
        let values = [
            f32::NEG_INFINITY,
            f32::MIN,
            -1.0e10,
            -2.5,
            -1.0,
            -f32::MIN_POSITIVE,
            -f32::from_bits(1),
            0.0,
            f32::from_bits(1),
            f32::MIN_POSITIVE,
            1.0,
            2.5,
            1.0e10,
            f32::MAX,
            f32::INFINITY,
        ];
        for pair in values.windows(2) {
            assert!(
                float_to_sortable_uint(pair[0]) < float_to_sortable_uint(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
        // -0.0 and +0.0 compare equal as floats but keep distinct bit patterns
        assert!(float_to_sortable_uint(-0.0) < float_to_sortable_uint(0.0));
    }

    #[test]
    fn test_order_preserved_random_pairs() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100_000 {
            let a: f32 = rng.gen_range(-1.0e6..1.0e6);
            let b: f32 = rng.gen_range(-1.0e6..1.0e6);
            if a < b {
                assert!(float_to_sortable_uint(a) < float_to_sortable_uint(b));
            } else if b < a {
                assert!(float_to_sortable_uint(b) < float_to_sortable_uint(a));
            }
        }
    }

    #[test]
    fn test_back_to_front_reverses_order() {
        let near = depth_sort_key(1.0, SortOrder::BackToFront);
        let far = depth_sort_key(100.0, SortOrder::BackToFront);
        assert!(far < near);

        let near = depth_sort_key(1.0, SortOrder::FrontToBack);
        let far = depth_sort_key(100.0, SortOrder::FrontToBack);
        assert!(near < far);
    }
}
