use std::{mem, ptr::NonNull};

use crate::list::Node;

/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since a `Block` is always a node of its page's block chain.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<Node<Block>>();

/// Alignment of a block header. Every payload size is rounded up to this so the
/// header that may follow the payload stays aligned.
pub(crate) const BLOCK_ALIGN: usize = mem::align_of::<Node<Block>>();

/// Pointer to a block header living inside a VM page.
pub(crate) type BlockRef = NonNull<Node<Block>>;

/// This is the structure of a block. The fields of the block are its metadata,
/// the payload handed to the user is placed right after this header.
///
/// The following diagram represents this structure ignoring that the block will be
/// wrapped inside a [`Node`], whose links point to the physically adjacent headers
/// of the same page.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |       offset        |        | -> Header
/// +---------------------+        |
/// |    is_free (1b)     |        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> `size` bytes
/// |         ...         |        |
/// +---------------------+ <------+
/// |  (hard fragment)    |        | -> < BLOCK_HEADER_SIZE bytes, only
/// +---------------------+ <------+    while the block is allocated
/// ```
///
/// For a free block `size` always matches the distance to the next header (or to
/// the end of the page). An allocated block may be followed by a few untracked
/// bytes that were too small to host a header of their own; they are folded back
/// into the block when it is freed.
#[derive(Debug)]
pub(crate) struct Block {
    /// Usable bytes following the header.
    pub size: usize,
    /// Offset of the header from the start of its page.
    pub offset: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
}

impl Block {
    pub(crate) const fn free(size: usize, offset: usize) -> Self {
        Self {
            size,
            offset,
            is_free: true,
        }
    }
}

/// Returns the first payload byte of `block`.
#[inline]
pub(crate) fn payload(block: BlockRef) -> NonNull<u8> {
    // SAFETY: the payload starts right after the header, inside the same page.
    unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}
