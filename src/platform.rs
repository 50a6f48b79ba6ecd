//! OS page mapping.

use core::ptr::{NonNull, null_mut};

use crate::error::AllocError;
use crate::size_class::PAGE_SHIFT;

#[cfg(test)]
thread_local! {
  static REFUSE: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Makes every `system_alloc` on the calling thread fail while `refuse` holds.
#[cfg(test)]
pub(crate) fn refuse_system_alloc(refuse: bool) {
  REFUSE.set(refuse);
}

/// Maps `pages` fresh zeroed pages, aligned to at least `1 << PAGE_SHIFT`.
pub(crate) fn system_alloc(pages: usize) -> Result<NonNull<u8>, AllocError> {
  #[cfg(test)]
  if REFUSE.get() {
    return Err(AllocError::OutOfMemory { pages });
  }

  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      pages << PAGE_SHIFT,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    return Err(AllocError::OutOfMemory { pages });
  }

  // mmap never hands out the zero page.
  let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
  debug_assert_eq!(ptr.as_ptr() as usize & ((1 << PAGE_SHIFT) - 1), 0);
  Ok(ptr)
}

/// Unmaps a region obtained from [`system_alloc`].
///
/// # Safety
///
/// `ptr` must come from `system_alloc(pages)` and nothing may reference the region afterwards.
pub(crate) unsafe fn system_free(ptr: NonNull<u8>, pages: usize) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), pages << PAGE_SHIFT) };
}
