//! Helpers shared by the integration tests.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::{collections::HashSet, ptr::NonNull};

use slabmm::{BLOCK_HEADER_SIZE, HeapPages, MemoryManager, PAGE_HEADER_SIZE};

pub const PAGE_SIZE: usize = 4096;

/// Payload bytes one page can hand out in a single allocation.
pub const MAX_ALLOCATION: usize = PAGE_SIZE - PAGE_HEADER_SIZE - BLOCK_HEADER_SIZE;

pub fn init_logging() {
    _ = env_logger::builder().is_test(true).try_init();
}

/// A manager with 4096 byte pages from the heap, independent of the machine.
pub fn manager() -> MemoryManager<HeapPages> {
    init_logging();

    MemoryManager::builder()
        .page_source(HeapPages::new(PAGE_SIZE))
        .build()
        .unwrap()
}

/// Start of the page holding `ptr`.
pub fn page_of(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize & !(PAGE_SIZE - 1)
}

/// Fills `len` bytes at `ptr` with a pattern derived from `seed`.
pub fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for index in 0..len {
        // SAFETY: the test owns `len` bytes at `ptr`.
        unsafe { ptr.add(index).write(seed.wrapping_add(index as u8)) };
    }
}

/// Whether the pattern written by [`fill`] is still intact.
pub fn holds_pattern(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|index| {
        // SAFETY: the test owns `len` bytes at `ptr`.
        unsafe { ptr.add(index).read() == seed.wrapping_add(index as u8) }
    })
}

/// Checks every structural property of every family:
///
/// * block headers and their spans cover each page exactly,
/// * no two neighbouring blocks are both free,
/// * free blocks are as large as their span,
/// * no page is left without allocated blocks,
/// * the free-block index holds exactly the free blocks, largest first.
pub fn check_invariants(manager: &MemoryManager<HeapPages>) {
    let usage = manager.dump_usage(None).unwrap();

    for family in usage.families() {
        let name = family.info().name();
        let mut free_in_pages = HashSet::new();

        for page in family.pages() {
            assert_eq!(page.capacity(), PAGE_SIZE - PAGE_HEADER_SIZE);
            assert_eq!(page.spanned_bytes(), page.capacity(), "{name}: page not covered\n{usage}");
            assert!(page.accounted_bytes() <= page.capacity());
            assert!(page.allocated_blocks() > 0, "{name}: empty page kept\n{usage}");

            let mut expected_offset = PAGE_HEADER_SIZE;
            for pair in page.blocks().windows(2) {
                assert!(
                    !(pair[0].is_free() && pair[1].is_free()),
                    "{name}: adjacent free blocks\n{usage}"
                );
                assert_eq!(pair[0].next(), Some(pair[1].address()));
                assert_eq!(pair[1].prev(), Some(pair[0].address()));
            }

            for block in page.blocks() {
                assert_eq!(block.offset(), expected_offset);
                assert_eq!(block.address(), page.address() + block.offset());
                assert!(block.span() >= block.size());
                assert!(block.span() - block.size() < BLOCK_HEADER_SIZE);

                if block.is_free() {
                    assert_eq!(block.size(), block.span());
                    free_in_pages.insert((block.address(), block.size()));
                }

                expected_offset += BLOCK_HEADER_SIZE + block.span();
            }
        }

        let indexed: HashSet<_> = family
            .free_blocks()
            .iter()
            .map(|block| (block.address(), block.size()))
            .collect();
        assert_eq!(indexed, free_in_pages, "{name}: free index out of sync\n{usage}");
        assert_eq!(indexed.len(), family.free_blocks().len());

        let sizes: Vec<usize> = family.free_blocks().iter().map(|block| block.size()).collect();
        assert!(
            sizes.windows(2).all(|pair| pair[0] >= pair[1]),
            "{name}: free index not ordered\n{usage}"
        );
    }
}
