//! Central cache: one locked span list per size class.
//!
//! Brokers batches of blocks between thread caches and spans. A bucket lock is
//! never held while the page-cache lock is taken: every trip to the page cache
//! goes through [`MutexGuard::unlocked`].

use core::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::AllocError;
use crate::free_list::next_of;
use crate::page_cache::PageCache;
use crate::size_class::{self, FREE_LIST_NUM};
use crate::span::{Span, SpanList};

/// Spans carved for one size class.
#[cfg_attr(feature = "padding", repr(align(64)))]
struct Bucket {
  spans: Mutex<SpanList>,
}

pub(crate) struct CentralCache {
  buckets: Box<[Bucket]>,
}

/// Null-terminated chain of blocks handed to a thread cache.
pub(crate) struct Batch {
  pub(crate) first: NonNull<u8>,
  pub(crate) last: NonNull<u8>,
  pub(crate) count: usize,
}

impl CentralCache {
  pub(crate) fn new() -> Self {
    let buckets = (0..FREE_LIST_NUM)
      .map(|_| Bucket {
        spans: Mutex::new(SpanList::new()),
      })
      .collect();
    Self { buckets }
  }

  /// Takes up to `batch` blocks of the aligned size `size` from one span.
  ///
  /// Fewer blocks come back when the chosen span has fewer left, but never zero.
  pub(crate) fn fetch_range_obj(
    &self,
    pages: &PageCache,
    batch: usize,
    size: usize,
  ) -> Result<Batch, AllocError> {
    debug_assert!(batch > 0);
    let mut spans = self.buckets[size_class::index(size)].spans.lock();
    let span = Self::get_one_span(&mut spans, pages, size)?;

    let s = span.as_ptr();
    unsafe {
      let count = batch.min((*s).free_list.len());
      let (first, last) = (*s).free_list.pop_range(count);
      (*s).use_count += count;
      Ok(Batch { first, last, count })
    }
  }

  /// A span of this bucket with at least one free block, carving a fresh one
  /// from the page cache if none is left.
  fn get_one_span(
    spans: &mut MutexGuard<'_, SpanList>,
    pages: &PageCache,
    size: usize,
  ) -> Result<NonNull<Span>, AllocError> {
    if let Some(span) = spans
      .iter()
      .find(|s| unsafe { !(*s.as_ptr()).free_list.is_empty() })
    {
      return Ok(span);
    }

    let span = MutexGuard::unlocked(spans, || -> Result<_, AllocError> {
      let npages = size_class::num_move_page(size);
      let span = pages.lock().new_span(npages)?;

      // Nobody else can reach the span until it is on the bucket list.
      unsafe {
        let (base, bytes) = (Span::base(span), Span::bytes(span));
        let s = span.as_ptr();
        (*s).obj_size = size;
        let objects = (*s).free_list.carve(base, bytes, size);
        trace!(size, pages = npages, objects, "carved span");
      }
      Ok(span)
    })?;

    unsafe { spans.push_front(span) };
    Ok(span)
  }

  /// Returns a null-terminated chain of `size`-byte blocks to their spans.
  /// Spans left with no block checked out go back to the page cache.
  ///
  /// # Safety
  ///
  /// Every block on the chain must have been handed out by
  /// [`fetch_range_obj`](Self::fetch_range_obj) for the same `size` and not
  /// returned since.
  pub(crate) unsafe fn release_list_to_spans(
    &self,
    pages: &PageCache,
    start: NonNull<u8>,
    size: usize,
  ) {
    let mut spans = self.buckets[size_class::index(size)].spans.lock();

    let mut cur = Some(start);
    while let Some(obj) = cur {
      cur = unsafe { next_of(obj) };

      let span = pages.map_object_to_span(obj);
      let s = span.as_ptr();
      unsafe {
        debug_assert_eq!((*s).obj_size, size);
        (*s).free_list.push(obj);
        (*s).use_count -= 1;

        if (*s).use_count == 0 {
          spans.erase(span);
          (*s).free_list.clear();
          MutexGuard::unlocked(&mut spans, || pages.lock().release_span(span));
        }
      }
    }
  }
}

#[cfg(test)]
impl CentralCache {
  /// Spans currently resident in the bucket for `size`.
  pub(crate) fn span_count(&self, size: usize) -> usize {
    self.buckets[size_class::index(size)].spans.lock().iter().count()
  }
}
