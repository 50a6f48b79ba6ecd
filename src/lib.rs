//! A three-tier concurrent small-object allocator.
//!
//! Requests of up to [`size_class::MAX_BYTES`] bytes are served from
//! equal-sized blocks:
//!
//! * a per-thread cache answers most calls without any lock,
//! * a central cache with one lock per size class moves batches of blocks
//!   between threads,
//! * a page cache behind a single lock carves page runs out of memory mapped
//!   from the OS and merges them again when they come back.
//!
//! The caller passes the original request size back on [`deallocate`]; blocks
//! carry no header.
//!
//! ```
//! let ptr = tierpool::allocate(24)?;
//! unsafe { tierpool::deallocate(ptr, 24) };
//! # Ok::<(), tierpool::AllocError>(())
//! ```

use core::ptr::NonNull;
use std::sync::OnceLock;

mod central_cache;
mod error;
mod free_list;
mod page_cache;
mod page_map;
mod platform;
pub mod size_class;
mod span;
mod thread_cache;

pub use error::AllocError;

use central_cache::CentralCache;
use page_cache::PageCache;
use thread_cache::with_thread_cache;

// =============================================================================
// Arena
// =============================================================================

/// The shared tiers. One per process, created on first use.
pub(crate) struct Arena {
  pub(crate) central: CentralCache,
  pub(crate) pages: PageCache,
}

static ARENA: OnceLock<Arena> = OnceLock::new();

impl Arena {
  pub(crate) fn new() -> Self {
    Self {
      central: CentralCache::new(),
      pages: PageCache::new(),
    }
  }

  #[inline]
  pub(crate) fn get() -> &'static Arena {
    ARENA.get_or_init(|| {
      tracing::debug!(
        classes = size_class::FREE_LIST_NUM,
        max_bytes = size_class::MAX_BYTES,
        "arena initialized"
      );
      Arena::new()
    })
  }
}

// =============================================================================
// API
// =============================================================================

/// Allocates a block of at least `size` bytes, aligned to 8 bytes.
///
/// # Errors
///
/// [`AllocError::InvalidSize`] if `size` is zero or above
/// [`size_class::MAX_BYTES`], [`AllocError::OutOfMemory`] if the OS refuses to
/// map more pages.
#[inline]
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  with_thread_cache(|cache| cache.allocate(size))
}

/// Returns a block to the allocator. Any thread may free any block.
///
/// Panics if `size` is zero or above [`size_class::MAX_BYTES`].
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] called with a `size` of the
/// same size class, and must not be freed twice or used afterwards.
#[inline]
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
  #[cfg(feature = "debug-tripwire")]
  check_deallocation(ptr, size);

  with_thread_cache(|cache| unsafe { cache.deallocate(ptr, size) });
}

// =============================================================================
// Tripwire
// =============================================================================

/// Catches frees that do not match what the allocator handed out.
#[cfg(feature = "debug-tripwire")]
fn check_deallocation(ptr: NonNull<u8>, size: usize) {
  assert!(
    size > 0 && size <= size_class::MAX_BYTES,
    "deallocation of {size} bytes cannot match any allocation"
  );

  let span = Arena::get().pages.map_object_to_span(ptr);
  // The span was carved before its first block left the central cache, and
  // that hand-off is ordered by the bucket lock.
  let (obj_size, base) = unsafe { ((*span.as_ptr()).obj_size, span::Span::base(span)) };
  let expected = size_class::round_up(size);
  assert!(obj_size != 0, "{ptr:p} lies in a span that holds no blocks");
  assert_eq!(
    obj_size, expected,
    "{ptr:p} freed as {size} bytes but its span holds {obj_size}-byte blocks"
  );
  assert_eq!(
    (ptr.as_ptr() as usize - base.as_ptr() as usize) % obj_size,
    0,
    "{ptr:p} is not the start of a block"
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn arena_is_shared() {
    assert!(core::ptr::eq(Arena::get(), Arena::get()));
  }

  #[test]
  fn api_round_trip() {
    let ptr = allocate(100).unwrap();
    unsafe {
      ptr.as_ptr().write_bytes(0xab, 100);
      deallocate(ptr, 100);
    }
  }

  #[test]
  fn api_reports_invalid_sizes() {
    assert_eq!(allocate(0), Err(AllocError::InvalidSize { size: 0 }));
    let too_big = size_class::MAX_BYTES + 1;
    assert_eq!(allocate(too_big), Err(AllocError::InvalidSize { size: too_big }));
  }

  #[cfg(feature = "debug-tripwire")]
  #[test]
  #[should_panic(expected = "freed as")]
  fn tripwire_catches_mismatched_size() {
    let ptr = allocate(16).unwrap();
    unsafe { deallocate(ptr, 4096) };
  }

  #[cfg(feature = "debug-tripwire")]
  #[test]
  #[should_panic(expected = "not the start of a block")]
  fn tripwire_catches_interior_pointer() {
    let ptr = allocate(64).unwrap();
    let inner = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(8)) };
    unsafe { deallocate(inner, 64) };
  }
}
