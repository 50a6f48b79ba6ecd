//! Size classes: map a request size to an aligned block size and a bucket index.
//!
//! Alignment grows with the request so the rounding waste stays near 1/8:
//!
//! | request range       | alignment | buckets |
//! |---------------------|-----------|---------|
//! | `[1, 128]`          | 8         | 16      |
//! | `[129, 1024]`       | 16        | 56      |
//! | `[1025, 8 KiB]`     | 128       | 56      |
//! | `(8 KiB, 64 KiB]`   | 1024      | 56      |
//! | `(64 KiB, 256 KiB]` | 8192      | 24      |
//!
//! Every function here is pure.

// =============================================================================
// Constants
// =============================================================================

/// Largest request served by the thread cache.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size-class buckets.
pub const FREE_LIST_NUM: usize = 208;

/// Largest span the page cache manages, in pages. Also the size of one OS chunk.
pub const PAGE_NUM: usize = 128;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bounds on the number of objects moved per central-cache transfer.
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 512;

/// `(last size in band, alignment shift)`, smallest band first.
const BANDS: [(usize, usize); 5] = [
  (128, 3),
  (1024, 4),
  (8 * 1024, 7),
  (64 * 1024, 10),
  (MAX_BYTES, 13),
];

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BANDS[BANDS.len() - 1].0 == MAX_BYTES);
const _: () = assert!(index(1) == 0);
const _: () = assert!(index(MAX_BYTES) == FREE_LIST_NUM - 1);
const _: () = assert!(num_move_page(MAX_BYTES) <= PAGE_NUM);
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(class_size(FREE_LIST_NUM - 1) == MAX_BYTES);

// =============================================================================
// Mapping
// =============================================================================

#[inline(always)]
const fn check_size(size: usize) {
  assert!(
    size > 0 && size <= MAX_BYTES,
    "size class lookup outside of (0, MAX_BYTES]"
  );
}

/// Alignment shift of the band containing `size`, along with the band's lower
/// bound (exclusive) and the first bucket index it owns.
#[inline(always)]
const fn band_of(size: usize) -> (usize, usize, usize) {
  let mut band = 0;
  let mut lower = 0;
  let mut first = 0;
  while size > BANDS[band].0 {
    first += (BANDS[band].0 - lower) >> BANDS[band].1;
    lower = BANDS[band].0;
    band += 1;
  }
  (BANDS[band].1, lower, first)
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Rounds `size` up to the alignment of its band.
///
/// Panics if `size` is zero or exceeds [`MAX_BYTES`].
#[inline]
pub const fn round_up(size: usize) -> usize {
  check_size(size);
  let (shift, _, _) = band_of(size);
  align_up(size, 1 << shift)
}

/// Bucket index of `size`, in `[0, FREE_LIST_NUM)`.
///
/// Bands occupy disjoint, consecutive index ranges, so the index is strictly
/// increasing in the aligned size.
///
/// Panics if `size` is zero or exceeds [`MAX_BYTES`].
#[inline]
pub const fn index(size: usize) -> usize {
  check_size(size);
  let (shift, lower, first) = band_of(size);
  first + ((size - lower + (1 << shift) - 1) >> shift) - 1
}

/// Aligned block size of bucket `index` (inverse of [`index`]).
///
/// Panics if `index` is not below [`FREE_LIST_NUM`].
#[inline]
pub const fn class_size(index: usize) -> usize {
  assert!(index < FREE_LIST_NUM, "bucket index out of range");
  let mut band = 0;
  let mut lower = 0;
  let mut first = 0;
  loop {
    let (upper, shift) = BANDS[band];
    let count = (upper - lower) >> shift;
    if index < first + count {
      return lower + ((index - first + 1) << shift);
    }
    first += count;
    lower = upper;
    band += 1;
  }
}

/// Objects moved per transfer between a thread cache and the central cache.
///
/// Small objects move in large batches to amortize the bucket lock; large
/// objects move in small batches so an idle thread does not hoard them.
#[inline]
pub const fn num_move_size(size: usize) -> usize {
  assert!(size > 0);
  let num = MAX_BYTES / size;
  if num < MIN_BATCH {
    MIN_BATCH
  } else if num > MAX_BATCH {
    MAX_BATCH
  } else {
    num
  }
}

/// Pages needed to hold one [`num_move_size`] batch of `size`-byte objects.
#[inline]
pub const fn num_move_page(size: usize) -> usize {
  let pages = (num_move_size(size) * size).div_ceil(PAGE_SIZE);
  if pages == 0 { 1 } else { pages }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn band_boundaries() {
    assert_eq!((round_up(1), index(1)), (8, 0));
    assert_eq!((round_up(128), index(128)), (128, 15));
    assert_eq!((round_up(129), index(129)), (144, 16));
    assert_eq!((round_up(1024), index(1024)), (1024, 71));
    assert_eq!((round_up(1025), index(1025)), (1152, 72));
    assert_eq!((round_up(8192), index(8192)), (8192, 127));
    assert_eq!((round_up(8193), index(8193)), (9216, 128));
    assert_eq!((round_up(65536), index(65536)), (65536, 183));
    assert_eq!((round_up(65537), index(65537)), (73728, 184));
    assert_eq!((round_up(MAX_BYTES), index(MAX_BYTES)), (MAX_BYTES, 207));
  }

  #[test]
  fn every_bucket_is_used_exactly_once() {
    let mut seen = [0usize; FREE_LIST_NUM];
    let mut prev_aligned = 0;
    let mut prev_index = None;
    for size in 1..=MAX_BYTES {
      let aligned = round_up(size);
      let idx = index(size);
      if aligned != prev_aligned {
        seen[idx] = aligned;
        if let Some(prev) = prev_index {
          assert_eq!(idx, prev + 1, "gap or collision at size {size}");
        }
        prev_aligned = aligned;
        prev_index = Some(idx);
      } else {
        assert_eq!(Some(idx), prev_index);
      }
    }
    assert!(seen.iter().all(|&s| s != 0));
  }

  #[test]
  fn class_size_inverts_index() {
    for idx in 0..FREE_LIST_NUM {
      let size = class_size(idx);
      assert_eq!(index(size), idx);
      assert_eq!(round_up(size), size);
    }
    assert_eq!(class_size(0), 8);
    assert_eq!(class_size(16), 144);
    assert_eq!(class_size(FREE_LIST_NUM - 1), MAX_BYTES);
  }

  #[test]
  fn batch_sizes() {
    assert_eq!(num_move_size(8), 512);
    assert_eq!(num_move_size(1024), 256);
    assert_eq!(num_move_size(MAX_BYTES), 2);
    assert_eq!(num_move_page(8), 1);
    assert_eq!(num_move_page(1024), 64);
    assert_eq!(num_move_page(MAX_BYTES), PAGE_NUM);
  }

  #[test]
  fn batch_always_fits_one_object() {
    for aligned in (1..=MAX_BYTES).map(round_up) {
      let pages = num_move_page(aligned);
      assert!((1..=PAGE_NUM).contains(&pages));
      assert!(pages * PAGE_SIZE >= aligned);
    }
  }

  #[test]
  #[should_panic(expected = "outside of (0, MAX_BYTES]")]
  fn index_rejects_oversized_request() {
    index(MAX_BYTES + 1);
  }

  #[test]
  #[should_panic(expected = "outside of (0, MAX_BYTES]")]
  fn round_up_rejects_zero() {
    round_up(0);
  }

  proptest! {
    #[test]
    fn round_up_is_stable(size in 1usize..=MAX_BYTES) {
      let aligned = round_up(size);
      prop_assert!(aligned >= size);
      prop_assert_eq!(round_up(aligned), aligned);
      prop_assert_eq!(index(aligned), index(size));
      prop_assert!(index(size) < FREE_LIST_NUM);
    }

    #[test]
    fn waste_is_bounded_above_first_band(size in 129usize..=MAX_BYTES) {
      let aligned = round_up(size);
      prop_assert!((aligned - size) * 8 < aligned);
    }

    #[test]
    fn index_follows_aligned_order(a in 1usize..=MAX_BYTES, b in 1usize..=MAX_BYTES) {
      let (ra, rb) = (round_up(a), round_up(b));
      prop_assert_eq!(ra.cmp(&rb), index(a).cmp(&index(b)));
    }
  }
}
