//! Per-thread front tier. Serves the hot path without any lock.

use core::cell::RefCell;
use core::ptr::NonNull;

use tracing::trace;

use crate::Arena;
use crate::central_cache::Batch;
use crate::error::AllocError;
use crate::free_list::{FreeList, next_of};
use crate::size_class::{self, FREE_LIST_NUM, MAX_BYTES};

// =============================================================================
// Thread Cache
// =============================================================================

/// One free list per size class, owned by a single thread.
pub(crate) struct ThreadCache<'a> {
  arena: &'a Arena,
  lists: [FreeList; FREE_LIST_NUM],
}

impl<'a> ThreadCache<'a> {
  pub(crate) fn new(arena: &'a Arena) -> Self {
    trace!("thread cache created");
    Self {
      arena,
      lists: [const { FreeList::new() }; FREE_LIST_NUM],
    }
  }

  pub(crate) fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 || size > MAX_BYTES {
      return Err(AllocError::InvalidSize { size });
    }

    let index = size_class::index(size);
    match self.lists[index].pop() {
      Some(obj) => Ok(obj),
      None => self.fetch_from_central_cache(index, size_class::round_up(size)),
    }
  }

  /// Puts a block back on this thread's list for its class. Once the list
  /// reaches its refill quota, that many blocks go back to the central cache.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`allocate`](Self::allocate) on a cache of the same
  /// arena with the same `size`, and must not be used afterwards.
  pub(crate) unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    assert!(
      size > 0 && size <= MAX_BYTES,
      "deallocation of {size} bytes cannot match any allocation"
    );

    let index = size_class::index(size);
    let list = &mut self.lists[index];
    unsafe { list.push(ptr) };
    if list.len() >= list.quota() {
      self.list_too_long(index, size_class::round_up(size));
    }
  }

  /// Refills an empty list with one batch and returns its first block.
  ///
  /// The batch starts at one block and grows by one per refill until it
  /// reaches the class's transfer size.
  fn fetch_from_central_cache(&mut self, index: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let limit = size_class::num_move_size(size);
    let list = &mut self.lists[index];
    let batch = list.quota().min(limit);

    let Batch { first, last, count } =
      self
        .arena
        .central
        .fetch_range_obj(&self.arena.pages, batch, size)?;
    debug_assert!(count >= 1 && count <= batch);

    if list.quota() < limit {
      list.set_quota(list.quota() + 1);
    }

    // The batch is null-terminated, so a single block has no successor.
    if let Some(rest) = unsafe { next_of(first) } {
      unsafe { list.push_range(rest, last, count - 1) };
    }
    Ok(first)
  }

  fn list_too_long(&mut self, index: usize, size: usize) {
    let list = &mut self.lists[index];
    let (first, _) = list.pop_range(list.quota());
    unsafe {
      self
        .arena
        .central
        .release_list_to_spans(&self.arena.pages, first, size)
    };
  }

  #[cfg(test)]
  pub(crate) fn list(&self, size: usize) -> &FreeList {
    &self.lists[size_class::index(size)]
  }
}

impl Drop for ThreadCache<'_> {
  fn drop(&mut self) {
    let mut returned = 0;
    for (index, list) in self.lists.iter_mut().enumerate() {
      let len = list.len();
      if len == 0 {
        continue;
      }
      let (first, _) = list.pop_range(len);
      unsafe {
        self
          .arena
          .central
          .release_list_to_spans(&self.arena.pages, first, size_class::class_size(index))
      };
      returned += len;
    }
    if returned > 0 {
      trace!(blocks = returned, "thread cache flushed");
    }
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static THREAD_CACHE: RefCell<ThreadCache<'static>> = RefCell::new(ThreadCache::new(Arena::get()));
}

/// Runs `f` against the calling thread's cache, creating it on first use.
///
/// While the thread is being torn down its cache may already be gone; the call
/// is then served by a short-lived cache that flushes as soon as `f` returns.
pub(crate) fn with_thread_cache<R>(mut f: impl FnMut(&mut ThreadCache<'static>) -> R) -> R {
  match THREAD_CACHE.try_with(|cache| f(&mut cache.borrow_mut())) {
    Ok(result) => result,
    Err(_) => {
      trace!("thread cache already torn down, serving from a temporary one");
      f(&mut ThreadCache::new(Arena::get()))
    }
  }
}
