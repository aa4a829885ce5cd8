//! Range alignment: maps a filesystem read window onto a backend fetch window.

/// Used when the configured block size is zero.
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_PREFETCH_SIZE: u64 = 32 * 1024 * 1024;

/// Block and prefetch sizes applied to every read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeLayout {
    pub block_size: u64,
    pub prefetch_size: u64,
}

impl Default for RangeLayout {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            prefetch_size: DEFAULT_PREFETCH_SIZE,
        }
    }
}

impl RangeLayout {
    pub fn new(block_size: u64, prefetch_size: u64) -> Self {
        Self {
            block_size,
            prefetch_size,
        }
    }

    /// See [`align_range`].
    pub fn align(&self, offset: u64, length: u64) -> (u64, u64) {
        align_range(offset, length, self.block_size, self.prefetch_size)
    }
}

/// Inclusive backend range `(start, end)` for a read of `length` bytes at
/// `offset`.
///
/// `start` is `offset` rounded down to a multiple of `block_size`. `end` is
/// `start + prefetch_size - 1`, clamped to `offset + length - 1` so the fetch
/// never extends past what the read needs. A zero `block_size` means
/// [`DEFAULT_BLOCK_SIZE`], a `prefetch_size` below the block size is raised to
/// it, and a zero `length` is treated as one byte.
pub fn align_range(offset: u64, length: u64, block_size: u64, prefetch_size: u64) -> (u64, u64) {
    let block = if block_size == 0 { DEFAULT_BLOCK_SIZE } else { block_size };
    let prefetch = prefetch_size.max(block);
    let length = length.max(1);

    let start = offset / block * block;
    let end = start.saturating_add(prefetch - 1);
    let last_needed = offset.saturating_add(length - 1);
    (start, end.min(last_needed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_align_small_read_inside_block() {
        let (start, end) = align_range(9 * MIB, 4096, 8 * MIB, 32 * MIB);
        assert_eq!(start, 8_388_608);
        assert_eq!(end, 9_441_279);
    }

    #[test]
    fn test_align_prefetch_limits_large_read() {
        let (start, end) = align_range(MIB, 64 * MIB, 8 * MIB, 32 * MIB);
        assert_eq!(start, 0);
        assert_eq!(end, 32 * MIB - 1);
    }

    #[test]
    fn test_align_degenerate_inputs() {
        // Zero block falls back to the default; prefetch is raised to the block.
        assert_eq!(align_range(9 * MIB, 16 * MIB, 0, 0), (8 * MIB, 16 * MIB - 1));
        assert_eq!(align_range(10, 100, 64, 16), (0, 63));
        // Zero-length reads behave like one-byte reads.
        assert_eq!(align_range(70, 0, 64, 128), (64, 70));
    }

    #[test]
    fn test_layout_defaults() {
        let layout = RangeLayout::default();
        assert_eq!(layout.align(0, 4096), (0, 4095));
        assert_eq!(layout.block_size, DEFAULT_BLOCK_SIZE);
    }

    proptest! {
        #[test]
        fn prop_start_is_block_aligned_and_end_is_bounded(
            offset in 0u64..(1u64 << 40),
            length in 1u64..(1u64 << 28),
            block in 1u64..(1u64 << 26),
            prefetch in 0u64..(1u64 << 27),
        ) {
            let (start, end) = align_range(offset, length, block, prefetch);
            prop_assert_eq!(start % block, 0);
            prop_assert!(start <= offset);
            prop_assert!(offset - start < block);
            let last_needed = offset + length - 1;
            prop_assert!(end <= last_needed);
            prop_assert!(end >= start);
            // Either the whole read is covered or the prefetch window is exhausted.
            if end < last_needed {
                prop_assert_eq!(end, start + prefetch.max(block) - 1);
            }
        }

        #[test]
        fn prop_align_is_idempotent(
            offset in 0u64..(1u64 << 40),
            length in 1u64..(1u64 << 28),
            block in 1u64..(1u64 << 26),
            prefetch in 0u64..(1u64 << 27),
        ) {
            let (start, end) = align_range(offset, length, block, prefetch);
            prop_assert_eq!(align_range(start, end - start + 1, block, prefetch), (start, end));
        }
    }
}
