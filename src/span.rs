//! Spans: runs of whole pages, the unit exchanged between the page cache and
//! the central cache.

use core::ptr::{NonNull, null_mut};

use crate::free_list::FreeList;
use crate::size_class::PAGE_SHIFT;

// =============================================================================
// Span
// =============================================================================

/// Descriptor of `pages` contiguous pages starting at page `page_id`.
///
/// Descriptors live on the heap and are owned by whichever [`SpanList`] holds
/// them. A span in transit between tiers is owned by the thread moving it.
/// Fields are accessed through raw pointers so a tier only ever borrows the
/// fields its lock protects.
pub(crate) struct Span {
  pub(crate) page_id: usize,
  pub(crate) pages: usize,
  /// Blocks carved from this span that are not checked out.
  pub(crate) free_list: FreeList,
  /// Blocks checked out to thread caches or in flight.
  pub(crate) use_count: usize,
  /// Block size the span was carved for. Zero while free in the page cache.
  pub(crate) obj_size: usize,
  /// Held by the central cache. Only read or written under the page-cache lock.
  pub(crate) in_use: bool,
  prev: *mut Span,
  next: *mut Span,
}

impl Span {
  fn new(page_id: usize, pages: usize) -> Self {
    Self {
      page_id,
      pages,
      free_list: FreeList::new(),
      use_count: 0,
      obj_size: 0,
      in_use: false,
      prev: null_mut(),
      next: null_mut(),
    }
  }

  /// Allocates a detached descriptor.
  pub(crate) fn alloc(page_id: usize, pages: usize) -> NonNull<Span> {
    NonNull::from(Box::leak(Box::new(Span::new(page_id, pages))))
  }

  /// Destroys a descriptor produced by [`Span::alloc`].
  ///
  /// # Safety
  ///
  /// `span` must be detached from every list and unreachable from the page map.
  pub(crate) unsafe fn free(span: NonNull<Span>) {
    drop(unsafe { Box::from_raw(span.as_ptr()) });
  }

  /// First byte of the span's memory.
  ///
  /// # Safety
  ///
  /// `span` must point to a live descriptor.
  #[inline]
  pub(crate) unsafe fn base(span: NonNull<Span>) -> NonNull<u8> {
    let addr = unsafe { (*span.as_ptr()).page_id } << PAGE_SHIFT;
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
  }

  /// Size of the span's memory in bytes.
  ///
  /// # Safety
  ///
  /// `span` must point to a live descriptor.
  #[inline]
  pub(crate) unsafe fn bytes(span: NonNull<Span>) -> usize {
    unsafe { (*span.as_ptr()).pages << PAGE_SHIFT }
  }
}

// =============================================================================
// Span List
// =============================================================================

/// Circular doubly linked list of spans around a heap-allocated sentinel.
pub(crate) struct SpanList {
  head: NonNull<Span>,
}

// SAFETY: the list exclusively owns its descriptors; callers synchronize access
// through the lock of the tier that holds the list.
unsafe impl Send for SpanList {}

impl SpanList {
  pub(crate) fn new() -> Self {
    let head = Span::alloc(0, 0);
    unsafe {
      (*head.as_ptr()).prev = head.as_ptr();
      (*head.as_ptr()).next = head.as_ptr();
    }
    Self { head }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    unsafe { (*self.head.as_ptr()).next == self.head.as_ptr() }
  }

  /// Takes ownership of `span`.
  ///
  /// # Safety
  ///
  /// `span` must be a live descriptor that is not on any list.
  pub(crate) unsafe fn push_front(&mut self, span: NonNull<Span>) {
    let head = self.head.as_ptr();
    let span = span.as_ptr();
    unsafe {
      debug_assert!((*span).prev.is_null() && (*span).next.is_null());
      (*span).next = (*head).next;
      (*span).prev = head;
      (*(*head).next).prev = span;
      (*head).next = span;
    }
  }

  /// Removes and returns the first span, handing ownership to the caller.
  pub(crate) fn pop_front(&mut self) -> Option<NonNull<Span>> {
    if self.is_empty() {
      return None;
    }
    let first = unsafe { NonNull::new_unchecked((*self.head.as_ptr()).next) };
    unsafe { self.erase(first) };
    Some(first)
  }

  /// Unlinks `span` in O(1) and hands ownership to the caller.
  ///
  /// # Safety
  ///
  /// `span` must be on this list.
  pub(crate) unsafe fn erase(&mut self, span: NonNull<Span>) {
    assert!(span != self.head, "the sentinel cannot be erased");
    let span = span.as_ptr();
    unsafe {
      (*(*span).prev).next = (*span).next;
      (*(*span).next).prev = (*span).prev;
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
  }

  pub(crate) fn iter(&self) -> Iter<'_> {
    Iter {
      list: self,
      cur: unsafe { (*self.head.as_ptr()).next },
    }
  }
}

impl Drop for SpanList {
  fn drop(&mut self) {
    while let Some(span) = self.pop_front() {
      unsafe { Span::free(span) };
    }
    unsafe { Span::free(self.head) };
  }
}

pub(crate) struct Iter<'a> {
  list: &'a SpanList,
  cur: *mut Span,
}

impl Iterator for Iter<'_> {
  type Item = NonNull<Span>;

  fn next(&mut self) -> Option<NonNull<Span>> {
    if self.cur == self.list.head.as_ptr() {
      return None;
    }
    let span = NonNull::new(self.cur)?;
    self.cur = unsafe { (*self.cur).next };
    Some(span)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page_ids(list: &SpanList) -> Vec<usize> {
    list
      .iter()
      .map(|s| unsafe { (*s.as_ptr()).page_id })
      .collect()
  }

  #[test]
  fn new_list_is_empty() {
    let mut list = SpanList::new();
    assert!(list.is_empty());
    assert_eq!(list.iter().count(), 0);
    assert!(list.pop_front().is_none());
  }

  #[test]
  fn push_front_and_pop_front() {
    let mut list = SpanList::new();
    for id in 1..=3 {
      unsafe { list.push_front(Span::alloc(id, 1)) };
    }
    assert_eq!(page_ids(&list), vec![3, 2, 1]);

    let first = list.pop_front().unwrap();
    assert_eq!(unsafe { (*first.as_ptr()).page_id }, 3);
    unsafe { Span::free(first) };
    assert_eq!(page_ids(&list), vec![2, 1]);
  }

  #[test]
  fn erase_from_the_middle() {
    let mut list = SpanList::new();
    let spans: Vec<_> = (1..=3).map(|id| Span::alloc(id, 1)).collect();
    for &s in &spans {
      unsafe { list.push_front(s) };
    }

    unsafe { list.erase(spans[1]) };
    assert_eq!(page_ids(&list), vec![3, 1]);
    unsafe {
      assert!((*spans[1].as_ptr()).prev.is_null());
      assert!((*spans[1].as_ptr()).next.is_null());
      Span::free(spans[1]);
    }

    unsafe { list.erase(spans[0]) };
    unsafe { list.erase(spans[2]) };
    assert!(list.is_empty());
    unsafe {
      Span::free(spans[0]);
      Span::free(spans[2]);
    }
  }

  #[test]
  fn base_and_bytes_follow_page_id() {
    let span = Span::alloc(5, 3);
    unsafe {
      assert_eq!(Span::base(span).as_ptr() as usize, 5 << PAGE_SHIFT);
      assert_eq!(Span::bytes(span), 3 << PAGE_SHIFT);
      Span::free(span);
    }
  }
}
