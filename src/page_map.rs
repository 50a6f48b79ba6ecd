//! Page id -> span index.
//!
//! A three-level radix tree over the page ids of the user address space.
//! Lookups are lock-free: they only follow atomically published pointers, so
//! the central cache can resolve objects while holding a bucket lock without
//! touching the page-cache lock. Writers must hold the page-cache lock.

use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::size_class::PAGE_SHIFT;
use crate::span::Span;

#[cfg(target_pointer_width = "64")]
const ADDRESS_BITS: usize = 48;
#[cfg(not(target_pointer_width = "64"))]
const ADDRESS_BITS: usize = usize::BITS as usize;

const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = PAGE_ID_BITS.div_ceil(3);
const MID_BITS: usize = LEAF_BITS;
const ROOT_BITS: usize = PAGE_ID_BITS - LEAF_BITS - MID_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

const _: () = assert!(ROOT_BITS + MID_BITS + LEAF_BITS == PAGE_ID_BITS);

struct Leaf {
  spans: [AtomicPtr<Span>; LEAF_LEN],
}

struct Mid {
  leaves: [AtomicPtr<Leaf>; MID_LEN],
}

pub(crate) struct PageMap {
  root: Box<[AtomicPtr<Mid>; ROOT_LEN]>,
}

/// Splits a page id into its three radix digits, or `None` if it lies outside
/// the covered address space.
#[inline(always)]
fn digits(page_id: usize) -> Option<(usize, usize, usize)> {
  if page_id >> PAGE_ID_BITS != 0 {
    return None;
  }
  let leaf = page_id & (LEAF_LEN - 1);
  let mid = (page_id >> LEAF_BITS) & (MID_LEN - 1);
  let root = page_id >> (LEAF_BITS + MID_BITS);
  Some((root, mid, leaf))
}

/// Returns the node behind `slot`, creating and publishing a zeroed one first if
/// the slot is empty.
fn get_or_create<T>(slot: &AtomicPtr<T>) -> &T {
  let mut node = slot.load(Ordering::Acquire);
  if node.is_null() {
    // SAFETY: every node type is an array of `AtomicPtr`, for which all-zero is valid (null).
    let fresh = Box::into_raw(unsafe { Box::<T>::new_zeroed().assume_init() });
    node = match slot.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => fresh,
      Err(existing) => {
        drop(unsafe { Box::from_raw(fresh) });
        existing
      }
    };
  }
  unsafe { &*node }
}

impl PageMap {
  pub(crate) fn new() -> Self {
    // SAFETY: all-zero is a valid array of null `AtomicPtr`s.
    let root = unsafe { Box::<[AtomicPtr<Mid>; ROOT_LEN]>::new_zeroed().assume_init() };
    Self { root }
  }

  /// Span recorded for `page_id`, if any.
  #[inline]
  pub(crate) fn get(&self, page_id: usize) -> Option<NonNull<Span>> {
    let (r, m, l) = digits(page_id)?;
    let mid = NonNull::new(self.root[r].load(Ordering::Acquire))?;
    let leaf = NonNull::new(unsafe { mid.as_ref() }.leaves[m].load(Ordering::Acquire))?;
    NonNull::new(unsafe { leaf.as_ref() }.spans[l].load(Ordering::Acquire))
  }

  /// Records `span` as the owner of `page_id`.
  pub(crate) fn set(&self, page_id: usize, span: NonNull<Span>) {
    let (r, m, l) = digits(page_id)
      .unwrap_or_else(|| panic!("page {page_id:#x} lies outside the mappable address space"));
    let mid = get_or_create(&self.root[r]);
    let leaf = get_or_create(&mid.leaves[m]);
    leaf.spans[l].store(span.as_ptr(), Ordering::Release);
  }

  /// Records `span` for every page in `page_id..page_id + pages`.
  pub(crate) fn set_range(&self, page_id: usize, pages: usize, span: NonNull<Span>) {
    for id in page_id..page_id + pages {
      self.set(id, span);
    }
  }

  /// Forgets every page in `page_id..page_id + pages`.
  pub(crate) fn clear_range(&self, page_id: usize, pages: usize) {
    for id in page_id..page_id + pages {
      let Some((r, m, l)) = digits(id) else {
        continue;
      };
      let Some(mid) = NonNull::new(self.root[r].load(Ordering::Acquire)) else {
        continue;
      };
      let Some(leaf) = NonNull::new(unsafe { mid.as_ref() }.leaves[m].load(Ordering::Acquire))
      else {
        continue;
      };
      unsafe { leaf.as_ref() }.spans[l].store(null_mut(), Ordering::Release);
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for slot in self.root.iter() {
      let mid = slot.load(Ordering::Relaxed);
      if mid.is_null() {
        continue;
      }
      let mid = unsafe { Box::from_raw(mid) };
      for leaf in mid.leaves.iter() {
        let leaf = leaf.load(Ordering::Relaxed);
        if !leaf.is_null() {
          drop(unsafe { Box::from_raw(leaf) });
        }
      }
    }
  }
}
