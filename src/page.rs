use std::{mem, ptr::NonNull};

use crate::{
    block::{BLOCK_ALIGN, BLOCK_HEADER_SIZE, Block, BlockRef},
    family::PageFamily,
    freelist::FreeList,
    list::{List, Node},
};

/// This is the overhead size introduced by the [`VmPage`] header in bytes.
/// The header is represented as a [`Node`] of its family's page list.
pub const PAGE_HEADER_SIZE: usize = mem::size_of::<Node<VmPage>>();

const _: () = assert!(PAGE_HEADER_SIZE % BLOCK_ALIGN == 0);

/// Pointer to the header at the start of a VM page.
pub(crate) type PageRef = NonNull<Node<VmPage>>;

/// Metadata at the start of every page handed to a family. The rest of the page is
/// covered, without gaps, by a chain of [`Block`]s:
///
/// ```text
/// +-------------------------------------------------------------------+
/// |        | +-------------+    +-------------+    +---------------+  |
/// | VmPage | | Block | ... | -> | Block | ... | -> | Block |  ...  |  |
/// |        | +-------------+    +-------------+    +---------------+  |
/// +-------------------------------------------------------------------+
///          |<----------------------- capacity ---------------------->|
/// ```
///
/// A page belongs to exactly one family and is unmapped as soon as its chain shrinks
/// to a single free block.
#[derive(Debug)]
pub(crate) struct VmPage {
    /// Family owning the page.
    pub family: NonNull<PageFamily>,
    /// Bytes covered by the block chain (page size minus this header).
    pub capacity: usize,
    /// Block headers in address order.
    pub blocks: List<Block>,
}

impl VmPage {
    /// Writes a page header at `base`, followed by one free block spanning the rest of
    /// the page, and pushes the page at the head of `pages`. Returns that free block.
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of `page_size` bytes and aligned to a block
    /// header. `page_size` must exceed `PAGE_HEADER_SIZE + BLOCK_HEADER_SIZE`.
    pub(crate) unsafe fn create(
        pages: &mut List<Self>,
        family: NonNull<PageFamily>,
        base: NonNull<u8>,
        page_size: usize,
    ) -> BlockRef {
        let capacity = page_size - PAGE_HEADER_SIZE;

        // SAFETY: the header and the first block both lie inside the page.
        unsafe {
            let mut page = pages.push_front(
                Self {
                    family,
                    capacity,
                    blocks: List::new(),
                },
                base,
            );

            page.as_mut().data.blocks.push_front(
                Block::free(capacity - BLOCK_HEADER_SIZE, PAGE_HEADER_SIZE),
                base.add(PAGE_HEADER_SIZE),
            )
        }
    }

    /// Finds the page hosting `block` from the offset stored in its header.
    ///
    /// # Safety
    ///
    /// `block` must point to a live block header.
    #[inline]
    pub(crate) unsafe fn of(block: BlockRef) -> PageRef {
        // SAFETY: the header lies `offset` bytes into its page.
        unsafe {
            let offset = block.as_ref().data.offset;
            block.cast::<u8>().sub(offset).cast()
        }
    }

    /// A page is empty when its chain is a single free block without neighbours.
    pub(crate) fn is_empty(&self) -> bool {
        match self.blocks.first() {
            // SAFETY: blocks of the chain are live.
            Some(block) => self.blocks.len() == 1 && unsafe { block.as_ref().data.is_free },
            None => false,
        }
    }

    /// Finds the block whose payload starts `payload_offset` bytes into the page.
    pub(crate) fn find_block(&self, payload_offset: usize) -> Option<BlockRef> {
        self.blocks.iter().find(|block| {
            // SAFETY: blocks of the chain are live.
            unsafe { block.as_ref().data.offset + BLOCK_HEADER_SIZE == payload_offset }
        })
    }

    /// Number of allocated blocks in the page.
    pub(crate) fn allocated_blocks(&self) -> usize {
        self.blocks
            .iter()
            // SAFETY: blocks of the chain are live.
            .filter(|block| unsafe { !block.as_ref().data.is_free })
            .count()
    }

    /// Physical bytes between the end of the header of `block` and the next header, or
    /// the end of the page for the last block. This is what the block really occupies,
    /// whatever its declared size says.
    ///
    /// # Safety
    ///
    /// `block` must be a block of this page.
    pub(crate) unsafe fn span(&self, block: BlockRef) -> usize {
        // SAFETY: `block` and its successor are live blocks of this page.
        unsafe {
            let node = block.as_ref();
            let start = node.data.offset + BLOCK_HEADER_SIZE;
            let end = match node.next {
                Some(next) => next.as_ref().data.offset,
                None => PAGE_HEADER_SIZE + self.capacity,
            };

            end - start
        }
    }

    /// Carves `size` bytes out of the free `block`, which leaves the free list.
    ///
    /// Whatever is left becomes a new free block right after the payload, as long as
    /// it can hold a header. Smaller leftovers stay attached to the allocated block
    /// without being accounted for; [`VmPage::reclaim`] takes them back.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of this page, present in `free_list`, with a size
    /// of at least `size`. `size` must be a multiple of the block header alignment.
    pub(crate) unsafe fn split_for_allocation(
        &mut self,
        mut block: BlockRef,
        size: usize,
        free_list: &mut FreeList,
    ) {
        // SAFETY: `block` is a live block of this page, per the caller.
        let (remaining, offset) = unsafe {
            free_list.remove(block);

            let data = &mut block.as_mut().data;
            debug_assert!(data.is_free && data.size >= size);

            let remaining = data.size - size;
            data.is_free = false;
            data.size = size;

            (remaining, data.offset + BLOCK_HEADER_SIZE + size)
        };

        if remaining < BLOCK_HEADER_SIZE {
            log::trace!("split at offset {offset}: {remaining} byte(s) left untracked");
            return;
        }

        // SAFETY: the new header starts right after the payload and ends before the next
        // block, since `remaining` covers at least one header.
        unsafe {
            let addr = block.cast::<u8>().add(BLOCK_HEADER_SIZE + size);
            let rest = self.blocks.insert_after(
                block,
                Block::free(remaining - BLOCK_HEADER_SIZE, offset),
                addr,
            );

            free_list.insert(rest);
        }

        log::trace!(
            "split at offset {offset}: free block of {} byte(s)",
            remaining - BLOCK_HEADER_SIZE
        );
    }

    /// Frees the allocated `block` and merges it with its free neighbours. Returns the
    /// surviving free block, which is not in the free list yet.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this page.
    pub(crate) unsafe fn reclaim(
        &mut self,
        mut block: BlockRef,
        free_list: &mut FreeList,
    ) -> BlockRef {
        // SAFETY: `block` is a live block of this page, per the caller.
        unsafe {
            let span = self.span(block);

            let data = &mut block.as_mut().data;
            debug_assert!(!data.is_free);
            data.is_free = true;
            // Takes back any leftover the allocation could not turn into a block.
            data.size = span;

            self.merge_with_next(block, free_list);
            self.merge_with_prev(&mut block, free_list);
        }

        block
    }

    /// Tries to merge the given block `node` with the next one in the page. This can
    /// be performed if that next block is free.
    ///
    /// # Safety
    ///
    /// `node` must be a free block of this page that is not in `free_list`.
    pub(crate) unsafe fn merge_with_next(&mut self, mut node: BlockRef, free_list: &mut FreeList) {
        // SAFETY: `node` and its successor are live blocks of this page.
        unsafe {
            let Some(next_node) = node.as_ref().next else {
                return;
            };

            if !next_node.as_ref().data.is_free {
                return;
            }

            // The next block leaves the free list before its header turns into payload.
            free_list.remove(next_node);

            node.as_mut().data.size += BLOCK_HEADER_SIZE + next_node.as_ref().data.size;
            self.blocks.remove(next_node);
        }
    }

    /// Tries to merge the given block `node` into the previous one in the page. This
    /// can be performed if that previous block is free, in which case `node` is updated
    /// to point to it.
    ///
    /// # Safety
    ///
    /// `node` must be a free block of this page that is not in `free_list`.
    pub(crate) unsafe fn merge_with_prev(&mut self, node: &mut BlockRef, free_list: &mut FreeList) {
        // SAFETY: `node` and its predecessor are live blocks of this page.
        unsafe {
            let Some(mut prev_node) = node.as_ref().prev else {
                return;
            };

            if !prev_node.as_ref().data.is_free {
                return;
            }

            // We extract the previous one from the free list, its size is about to change.
            free_list.remove(prev_node);

            prev_node.as_mut().data.size += BLOCK_HEADER_SIZE + node.as_ref().data.size;
            self.blocks.remove(*node);

            *node = prev_node;
        }
    }
}
