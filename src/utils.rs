//! Helper functions that don't belong to any concrete module of the allocator.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// Request sizes are aligned to the block header alignment so that the header
/// written right after a payload is itself properly aligned. `alignment` must be
/// a power of two.
pub(crate) const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}
