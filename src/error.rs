use thiserror::Error;

/// Why an allocation request could not be served.
///
/// Only conditions a caller can act on are reported here. Misuse of the
/// allocator's internal invariants panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("request of {size} bytes is outside of (0, 262144]")]
  InvalidSize { size: usize },

  #[error("operating system refused a chunk of {pages} pages")]
  OutOfMemory { pages: usize },
}
