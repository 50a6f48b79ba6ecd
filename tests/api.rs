use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::mpsc;
use std::thread;

use proptest::prelude::*;
use tierpool::size_class::{MAX_BYTES, index, round_up};
use tierpool::{AllocError, allocate, deallocate};

fn fill(ptr: NonNull<u8>, size: usize, byte: u8) {
  unsafe { ptr.as_ptr().write_bytes(byte, size) };
}

fn holds(ptr: NonNull<u8>, size: usize, byte: u8) -> bool {
  let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
  bytes.iter().all(|&b| b == byte)
}

#[test]
fn every_class_round_trips() {
  let mut size = 1;
  while size <= MAX_BYTES {
    let ptr = allocate(size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0, "{size}-byte block is misaligned");
    fill(ptr, round_up(size), 0x5a);
    unsafe { deallocate(ptr, size) };
    size = round_up(size) + 1;
  }
}

#[test]
fn out_of_range_sizes_are_rejected() {
  assert_eq!(allocate(0), Err(AllocError::InvalidSize { size: 0 }));
  assert_eq!(
    allocate(MAX_BYTES + 1),
    Err(AllocError::InvalidSize { size: MAX_BYTES + 1 })
  );
  assert_eq!(
    AllocError::InvalidSize { size: 0 }.to_string(),
    "request of 0 bytes is outside of (0, 262144]"
  );

  let ptr = allocate(MAX_BYTES).unwrap();
  fill(ptr, MAX_BYTES, 1);
  unsafe { deallocate(ptr, MAX_BYTES) };
}

#[test]
#[should_panic(expected = "cannot match any allocation")]
fn zero_sized_free_panics() {
  let ptr = allocate(8).unwrap();
  unsafe { deallocate(ptr, 0) };
}

#[test]
fn sizes_in_one_class_share_blocks() {
  // 129 and 144 both round to 144.
  assert_eq!(index(129), index(144));
  let a = allocate(129).unwrap();
  fill(a, 144, 3);
  unsafe { deallocate(a, 144) };
}

#[test]
fn blocks_from_exited_threads_stay_valid() {
  let handed_over: Vec<_> = thread::spawn(|| {
    (0..200)
      .map(|i| {
        let ptr = allocate(40).unwrap();
        fill(ptr, 40, i as u8);
        ptr.as_ptr() as usize
      })
      .collect()
  })
  .join()
  .unwrap();

  for (i, addr) in handed_over.into_iter().enumerate() {
    let ptr = NonNull::new(addr as *mut u8).unwrap();
    assert!(holds(ptr, 40, i as u8));
    unsafe { deallocate(ptr, 40) };
  }
}

#[test]
fn threads_allocate_concurrently_without_sharing_blocks() {
  const THREADS: usize = 8;
  const ROUNDS: usize = 50;

  thread::scope(|s| {
    for t in 0..THREADS {
      s.spawn(move || {
        let byte = t as u8 + 1;
        let sizes = [8, 24, 100, 512, 3000, 20_000];
        for round in 0..ROUNDS {
          let live: Vec<_> = sizes
            .iter()
            .cycle()
            .take(60 + round)
            .map(|&size| {
              let ptr = allocate(size).unwrap();
              fill(ptr, size, byte);
              (ptr, size)
            })
            .collect();
          for &(ptr, size) in &live {
            assert!(holds(ptr, size, byte), "another thread wrote into a live block");
          }
          for (ptr, size) in live {
            unsafe { deallocate(ptr, size) };
          }
        }
      });
    }
  });
}

#[test]
fn threads_on_disjoint_classes_never_see_each_others_writes() {
  const OPS: usize = 20_000;
  let classes: [[usize; 4]; 2] = [[8, 200, 3000, 70_000], [16, 400, 9000, 200_000]];
  for (a, b) in classes[0].iter().zip(&classes[1]) {
    assert_ne!(index(*a), index(*b));
  }

  thread::scope(|s| {
    for (t, sizes) in classes.into_iter().enumerate() {
      s.spawn(move || {
        let byte = 0xa0 + t as u8;
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        for op in 0..OPS {
          let size = sizes[op % sizes.len()];
          let ptr = allocate(size).unwrap();
          fill(ptr, size, byte);
          live.push((ptr, size));

          // Keep a bounded working set so lists both grow and drain.
          if live.len() > 64 {
            let (old, old_size) = live.swap_remove((op * 7) % live.len());
            assert!(holds(old, old_size, byte), "block of {old_size} bytes was overwritten");
            unsafe { deallocate(old, old_size) };
          }
        }
        for (ptr, size) in live {
          assert!(holds(ptr, size, byte));
          unsafe { deallocate(ptr, size) };
        }
      });
    }
  });
}

#[test]
fn blocks_freed_on_another_thread_are_reusable() {
  let (tx, rx) = mpsc::channel::<usize>();

  let consumer = thread::spawn(move || {
    let mut freed = 0;
    for addr in rx {
      let ptr = NonNull::new(addr as *mut u8).unwrap();
      assert!(holds(ptr, 72, 0xc3));
      unsafe { deallocate(ptr, 72) };
      freed += 1;
    }
    freed
  });

  for _ in 0..2000 {
    let ptr = allocate(72).unwrap();
    fill(ptr, 72, 0xc3);
    tx.send(ptr.as_ptr() as usize).unwrap();
  }
  drop(tx);
  assert_eq!(consumer.join().unwrap(), 2000);
}

#[derive(Debug, Clone)]
enum Op {
  Alloc(usize),
  Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    3 => (1..=MAX_BYTES / 16).prop_map(Op::Alloc),
    1 => (1..=MAX_BYTES).prop_map(Op::Alloc),
    3 => any::<usize>().prop_map(Op::Free),
  ]
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..200)) {
    // start address -> (end address, size, fill byte)
    let mut live: HashMap<usize, (usize, usize, u8)> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
      match op {
        Op::Alloc(size) => {
          let ptr = allocate(size).unwrap();
          let start = ptr.as_ptr() as usize;
          let end = start + size;
          for (&other, &(other_end, _, _)) in &live {
            prop_assert!(end <= other || other_end <= start, "{start:#x} overlaps {other:#x}");
          }
          let byte = step as u8;
          fill(ptr, size, byte);
          live.insert(start, (end, size, byte));
          order.push(start);
        }
        Op::Free(pick) if !order.is_empty() => {
          let start = order.swap_remove(pick % order.len());
          let (_, size, byte) = live.remove(&start).unwrap();
          let ptr = NonNull::new(start as *mut u8).unwrap();
          prop_assert!(holds(ptr, size, byte));
          unsafe { deallocate(ptr, size) };
        }
        Op::Free(_) => {}
      }
    }

    for (start, (_, size, byte)) in live {
      let ptr = NonNull::new(start as *mut u8).unwrap();
      prop_assert!(holds(ptr, size, byte));
      unsafe { deallocate(ptr, size) };
    }
  }
}
