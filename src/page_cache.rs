//! Page cache: free spans bucketed by page count, behind one lock.
//!
//! The only tier that talks to the OS and the only tier that splits or merges
//! spans. Spans are created whole from 128-page chunks, split on demand, and
//! merged with free neighbors when the central cache gives them back.

use core::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::AllocError;
use crate::page_map::PageMap;
use crate::platform::{system_alloc, system_free};
use crate::size_class::{PAGE_NUM, PAGE_SHIFT};
use crate::span::{Span, SpanList};

pub(crate) struct PageCache {
  spans: Mutex<PageSpans>,
  /// Read without the lock, written only with it.
  map: PageMap,
}

/// State guarded by the page-cache lock.
struct PageSpans {
  /// `lists[n]` holds free spans of exactly `n` pages. Slot 0 is unused.
  lists: [SpanList; PAGE_NUM + 1],
  /// Every chunk obtained from the OS, in acquisition order.
  chunks: Vec<NonNull<u8>>,
}

// SAFETY: the chunk pointers are plain addresses owned by this structure.
unsafe impl Send for PageSpans {}

impl Drop for PageSpans {
  fn drop(&mut self) {
    for &chunk in &self.chunks {
      unsafe { system_free(chunk, PAGE_NUM) };
    }
  }
}

/// Held page-cache lock.
pub(crate) struct PageCacheGuard<'a> {
  spans: MutexGuard<'a, PageSpans>,
  map: &'a PageMap,
}

impl PageCache {
  pub(crate) fn new() -> Self {
    Self {
      spans: Mutex::new(PageSpans {
        lists: core::array::from_fn(|_| SpanList::new()),
        chunks: Vec::new(),
      }),
      map: PageMap::new(),
    }
  }

  pub(crate) fn lock(&self) -> PageCacheGuard<'_> {
    PageCacheGuard {
      spans: self.spans.lock(),
      map: &self.map,
    }
  }

  /// Span owning the page that contains `ptr`, if the allocator issued it.
  #[inline]
  pub(crate) fn lookup(&self, ptr: NonNull<u8>) -> Option<NonNull<Span>> {
    self.map.get(ptr.as_ptr() as usize >> PAGE_SHIFT)
  }

  /// Span owning the page that contains `ptr`.
  ///
  /// Panics if no span owns it: the pointer is foreign or memory is corrupt.
  #[inline]
  pub(crate) fn map_object_to_span(&self, ptr: NonNull<u8>) -> NonNull<Span> {
    match self.lookup(ptr) {
      Some(span) => span,
      None => panic!("{ptr:p} does not belong to any span issued by this allocator"),
    }
  }
}

impl PageCacheGuard<'_> {
  /// Hands out a `k`-page span for the central cache, marked in use and mapped
  /// on every page.
  pub(crate) fn new_span(&mut self, k: usize) -> Result<NonNull<Span>, AllocError> {
    assert!((1..=PAGE_NUM).contains(&k), "span of {k} pages requested");

    // 1) Exact fit.
    if let Some(span) = self.spans.lists[k].pop_front() {
      unsafe { self.check_out(span) };
      return Ok(span);
    }

    // 2) Split the first larger span. The tail stays free.
    for n in k + 1..=PAGE_NUM {
      let Some(big) = self.spans.lists[n].pop_front() else {
        continue;
      };

      let head = unsafe {
        let b = big.as_ptr();
        let head = Span::alloc((*b).page_id, k);
        (*b).page_id += k;
        (*b).pages -= k;
        self.publish_free(big);
        head
      };
      unsafe { self.check_out(head) };
      return Ok(head);
    }

    // 3) Grow by one chunk, then split it.
    let chunk = system_alloc(PAGE_NUM).inspect_err(|err| warn!(%err, "page cache exhausted"))?;
    self.spans.chunks.push(chunk);
    debug!(
      base = ?chunk,
      pages = PAGE_NUM,
      chunks = self.spans.chunks.len(),
      "acquired chunk from OS"
    );

    let span = Span::alloc(chunk.as_ptr() as usize >> PAGE_SHIFT, PAGE_NUM);
    unsafe { self.publish_free(span) };
    self.new_span(k)
  }

  /// Takes back a span the central cache has fully drained, merging it with
  /// free neighbors on both sides.
  ///
  /// # Safety
  ///
  /// `span` must have come from [`new_span`](Self::new_span), be detached from
  /// every list and have no blocks checked out.
  pub(crate) unsafe fn release_span(&mut self, span: NonNull<Span>) {
    let s = span.as_ptr();
    unsafe {
      debug_assert!((*s).in_use);
      debug_assert_eq!((*s).use_count, 0);

      // Leftward.
      while let Some(left) = (*s).page_id.checked_sub(1).and_then(|id| self.map.get(id)) {
        let l = left.as_ptr();
        if (*l).in_use || (*l).pages + (*s).pages > PAGE_NUM {
          break;
        }
        debug_assert_eq!((*l).page_id + (*l).pages, (*s).page_id);
        trace!(page_id = (*l).page_id, pages = (*l).pages, "coalescing left neighbor");

        (*s).page_id = (*l).page_id;
        (*s).pages += (*l).pages;
        self.absorb(left);
      }

      // Rightward.
      while let Some(right) = self.map.get((*s).page_id + (*s).pages) {
        let r = right.as_ptr();
        if (*r).in_use || (*r).pages + (*s).pages > PAGE_NUM {
          break;
        }
        debug_assert_eq!((*r).page_id, (*s).page_id + (*s).pages);
        trace!(page_id = (*r).page_id, pages = (*r).pages, "coalescing right neighbor");

        (*s).pages += (*r).pages;
        self.absorb(right);
      }

      (*s).in_use = false;
      (*s).obj_size = 0;
      (*s).free_list.clear();
      trace!(page_id = (*s).page_id, pages = (*s).pages, "span returned to page cache");
      self.publish_free(span);
    }
  }

  /// Files a free span under its page count and maps its boundary pages so
  /// neighbors can find it.
  unsafe fn publish_free(&mut self, span: NonNull<Span>) {
    let (page_id, pages) = unsafe { ((*span.as_ptr()).page_id, (*span.as_ptr()).pages) };
    unsafe { self.spans.lists[pages].push_front(span) };
    self.map.set(page_id, span);
    self.map.set(page_id + pages - 1, span);
  }

  /// Marks a span as leaving the free pool and maps every page, so any address
  /// inside it resolves.
  unsafe fn check_out(&mut self, span: NonNull<Span>) {
    let s = span.as_ptr();
    unsafe {
      (*s).in_use = true;
      self.map.set_range((*s).page_id, (*s).pages, span);
    }
  }

  /// Destroys a free neighbor whose pages were just taken over.
  unsafe fn absorb(&mut self, neighbor: NonNull<Span>) {
    let n = neighbor.as_ptr();
    unsafe {
      self.spans.lists[(*n).pages].erase(neighbor);
      self.map.clear_range((*n).page_id, (*n).pages);
      Span::free(neighbor);
    }
  }
}

#[cfg(test)]
impl PageCache {
  /// Free spans of exactly `pages` pages.
  pub(crate) fn free_spans(&self, pages: usize) -> usize {
    self.spans.lock().lists[pages].iter().count()
  }

  pub(crate) fn chunk_count(&self) -> usize {
    self.spans.lock().chunks.len()
  }
}
