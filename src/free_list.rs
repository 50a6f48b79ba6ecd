//! Intrusive list of equal-sized free blocks.
//!
//! A free block stores the address of the next free block in its first word,
//! so the list needs no storage of its own. Used by every thread-cache bucket
//! and by every carved span.

use core::ptr::{NonNull, null_mut};

#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Reads the link stored in a free block.
///
/// # Safety
///
/// `block` must be a free block whose first word holds a valid link or null.
#[inline(always)]
pub(crate) unsafe fn next_of(block: NonNull<u8>) -> Option<NonNull<u8>> {
  let next = unsafe { (*block.cast::<FreeBlock>().as_ptr()).next };
  NonNull::new(next.cast())
}

#[inline(always)]
unsafe fn set_next(block: NonNull<u8>, next: *mut u8) {
  unsafe { (*block.cast::<FreeBlock>().as_ptr()).next = next.cast() };
}

pub(crate) struct FreeList {
  head: *mut FreeBlock,
  len: usize,
  /// Slow-start batch size for thread-cache refills. Unused inside spans.
  quota: usize,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      quota: 1,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn quota(&self) -> usize {
    self.quota
  }

  #[inline]
  pub(crate) fn set_quota(&mut self, quota: usize) {
    self.quota = quota;
  }

  /// # Safety
  ///
  /// `obj` must be writable for one pointer-sized word, aligned for it, and
  /// not already on any free list.
  #[inline]
  pub(crate) unsafe fn push(&mut self, obj: NonNull<u8>) {
    unsafe { set_next(obj, self.head.cast()) };
    self.head = obj.cast().as_ptr();
    self.len += 1;
  }

  /// Splices a chain of `n` blocks running from `first` to `last` onto the front.
  ///
  /// # Safety
  ///
  /// `first..=last` must be a well-formed chain of exactly `n` free blocks.
  #[inline]
  pub(crate) unsafe fn push_range(&mut self, first: NonNull<u8>, last: NonNull<u8>, n: usize) {
    unsafe { set_next(last, self.head.cast()) };
    self.head = first.cast().as_ptr();
    self.len += n;
  }

  #[inline]
  pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
    let obj = NonNull::new(self.head.cast::<u8>())?;
    self.head = unsafe { next_of(obj) }.map_or(null_mut(), |next| next.cast().as_ptr());
    self.len -= 1;
    Some(obj)
  }

  /// Unlinks the first `n` blocks and returns the ends of the detached chain.
  /// The chain is null-terminated.
  ///
  /// Panics if `n` is zero or larger than the list.
  pub(crate) fn pop_range(&mut self, n: usize) -> (NonNull<u8>, NonNull<u8>) {
    assert!(
      n > 0 && n <= self.len,
      "pop_range of {n} blocks from a list of {}",
      self.len
    );

    let first = NonNull::new(self.head.cast::<u8>()).expect("non-empty list has a head");
    let mut last = first;
    for _ in 1..n {
      last = unsafe { next_of(last) }.expect("list shorter than its length");
    }

    self.head = unsafe { next_of(last) }.map_or(null_mut(), |next| next.cast().as_ptr());
    unsafe { set_next(last, null_mut()) };
    self.len -= n;
    (first, last)
  }

  /// Forgets every block. The blocks themselves are untouched.
  pub(crate) fn clear(&mut self) {
    self.head = null_mut();
    self.len = 0;
  }

  /// Cuts `bytes` starting at `base` into `size`-byte blocks, linked in address
  /// order, and makes them the whole list. Returns the number of blocks.
  ///
  /// # Safety
  ///
  /// `base..base + bytes` must be writable memory owned by the caller, `base`
  /// must be word aligned and `size` a multiple of the word size. The list must be empty.
  pub(crate) unsafe fn carve(&mut self, base: NonNull<u8>, bytes: usize, size: usize) -> usize {
    debug_assert!(self.is_empty());
    let count = bytes / size;
    assert!(count > 0, "span of {bytes} bytes cannot hold a {size}-byte block");

    let start = base.as_ptr();
    for i in 0..count - 1 {
      unsafe {
        let block = NonNull::new_unchecked(start.add(i * size));
        set_next(block, start.add((i + 1) * size));
      }
    }
    unsafe { set_next(NonNull::new_unchecked(start.add((count - 1) * size)), null_mut()) };

    self.head = start.cast();
    self.len = count;
    count
  }
}
