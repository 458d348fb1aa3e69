//! Snapshots of the manager's state for diagnostics.
//!
//! The reports copy everything they show, so they stay valid after the manager
//! changes. Their `Display` output is meant for people; the text format is not stable.

use std::fmt;

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockRef},
    family::PageFamily,
    page::PageRef,
};

/// Name and element size of a registered family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FamilyInfo {
    name: String,
    element_size: usize,
}

impl FamilyInfo {
    pub(crate) fn of(family: &PageFamily) -> Self {
        Self {
            name: family.name.as_str().to_string(),
            element_size: family.element_size,
        }
    }

    /// Name the family was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }
}

impl fmt::Display for FamilyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.element_size)
    }
}

/// Every registered family, as laid out in the descriptor pages.
#[derive(Clone, Debug)]
pub struct RegistryReport {
    pub(crate) page_size: usize,
    pub(crate) families_per_page: usize,
    pub(crate) descriptor_pages: Vec<Vec<FamilyInfo>>,
}

impl RegistryReport {
    /// Page size of the manager in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// How many family descriptors fit in one descriptor page.
    pub fn families_per_page(&self) -> usize {
        self.families_per_page
    }

    /// Families grouped by descriptor page, most recent page first. Within a page the
    /// families are in registration order.
    pub fn descriptor_pages(&self) -> &[Vec<FamilyInfo>] {
        &self.descriptor_pages
    }

    /// All families.
    pub fn families(&self) -> impl Iterator<Item = &FamilyInfo> {
        self.descriptor_pages.iter().flatten()
    }
}

impl fmt::Display for RegistryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "page size: {} bytes, {} families per descriptor page",
            self.page_size, self.families_per_page
        )?;

        for (index, families) in self.descriptor_pages.iter().enumerate() {
            writeln!(f, "descriptor page {index}:")?;
            for family in families {
                writeln!(f, "  {family}")?;
            }
        }

        Ok(())
    }
}

/// Block level usage of some or all families.
#[derive(Clone, Debug)]
pub struct UsageReport {
    pub(crate) families: Vec<FamilyUsage>,
}

impl UsageReport {
    /// Usage per family.
    pub fn families(&self) -> &[FamilyUsage] {
        &self.families
    }

    /// Usage of the family called `name`, if it is part of the report.
    pub fn family(&self, name: &str) -> Option<&FamilyUsage> {
        self.families.iter().find(|usage| usage.info.name == name)
    }
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for family in &self.families {
            write!(f, "{family}")?;
        }

        Ok(())
    }
}

/// A free block as seen by the family's free-block index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeBlockUsage {
    address: usize,
    size: usize,
}

impl FreeBlockUsage {
    /// Address of the block header.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size the block is indexed with.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Pages and free-block index of one family.
#[derive(Clone, Debug)]
pub struct FamilyUsage {
    info: FamilyInfo,
    pages: Vec<PageUsage>,
    free_blocks: Vec<FreeBlockUsage>,
}

impl FamilyUsage {
    pub(crate) fn of(family: &PageFamily) -> Self {
        Self {
            info: FamilyInfo::of(family),
            pages: family.pages.iter().map(PageUsage::of).collect(),
            free_blocks: family
                .free_list
                .iter()
                .map(|(block, size)| FreeBlockUsage {
                    address: block.as_ptr() as usize,
                    size,
                })
                .collect(),
        }
    }

    /// The family this usage belongs to.
    pub fn info(&self) -> &FamilyInfo {
        &self.info
    }

    /// Pages of the family, most recently created first.
    pub fn pages(&self) -> &[PageUsage] {
        &self.pages
    }

    /// The free-block index in order, largest block first.
    pub fn free_blocks(&self) -> &[FreeBlockUsage] {
        &self.free_blocks
    }

    /// Number of allocated blocks over all pages.
    pub fn allocated_blocks(&self) -> usize {
        self.pages.iter().map(PageUsage::allocated_blocks).sum()
    }
}

impl fmt::Display for FamilyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "family {}: {} page(s)", self.info, self.pages.len())?;

        for page in &self.pages {
            write!(f, "{page}")?;
        }

        write!(f, "  free blocks:")?;
        if self.free_blocks.is_empty() {
            write!(f, " none")?;
        }
        for block in &self.free_blocks {
            write!(f, " {}@{:#x}", block.size, block.address)?;
        }

        writeln!(f)
    }
}

/// One VM page and its block chain.
#[derive(Clone, Debug)]
pub struct PageUsage {
    address: usize,
    capacity: usize,
    prev: Option<usize>,
    next: Option<usize>,
    blocks: Vec<BlockUsage>,
}

impl PageUsage {
    fn of(page: PageRef) -> Self {
        // SAFETY: pages of a family are live while the manager is borrowed.
        let node = unsafe { page.as_ref() };
        let vm_page = &node.data;

        Self {
            address: page.as_ptr() as usize,
            capacity: vm_page.capacity,
            prev: node.prev.map(|prev| prev.as_ptr() as usize),
            next: node.next.map(|next| next.as_ptr() as usize),
            blocks: vm_page
                .blocks
                .iter()
                // SAFETY: every block of the chain belongs to this page.
                .map(|block| BlockUsage::of(block, unsafe { vm_page.span(block) }))
                .collect(),
        }
    }

    /// Address of the page.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes after the page header, covered by block headers and payloads.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Previous page of the family.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    /// Next page of the family.
    pub fn next(&self) -> Option<usize> {
        self.next
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> &[BlockUsage] {
        &self.blocks
    }

    /// Number of allocated blocks in the page.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.iter().filter(|block| !block.is_free).count()
    }

    /// Bytes the chain physically covers: every header plus everything up to the next
    /// one. Always equals [`capacity`](Self::capacity).
    pub fn spanned_bytes(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| BLOCK_HEADER_SIZE + block.span)
            .sum()
    }

    /// Bytes accounted for by the declared block sizes. Falls short of
    /// [`capacity`](Self::capacity) by the leftovers too small to become a block.
    pub fn accounted_bytes(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| BLOCK_HEADER_SIZE + block.size)
            .sum()
    }
}

impl fmt::Display for PageUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  page {:#x}: capacity {}, {} block(s), {} allocated",
            self.address,
            self.capacity,
            self.blocks.len(),
            self.allocated_blocks()
        )?;

        for block in &self.blocks {
            writeln!(f, "    {block}")?;
        }

        Ok(())
    }
}

/// One block header and the memory it governs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockUsage {
    address: usize,
    offset: usize,
    size: usize,
    span: usize,
    is_free: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl BlockUsage {
    fn of(block: BlockRef, span: usize) -> Self {
        // SAFETY: blocks of a live page are live.
        let node = unsafe { block.as_ref() };

        Self {
            address: block.as_ptr() as usize,
            offset: node.data.offset,
            size: node.data.size,
            span,
            is_free: node.data.is_free,
            prev: node.prev.map(|prev| prev.as_ptr() as usize),
            next: node.next.map(|next| next.as_ptr() as usize),
        }
    }

    /// Address of the block header.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Address of the payload, which is what `allocate` hands out.
    pub fn payload(&self) -> usize {
        self.address + BLOCK_HEADER_SIZE
    }

    /// Offset of the header from the start of its page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Declared payload size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes up to the next header, or the end of the page. At least [`size`](Self::size).
    pub fn span(&self) -> usize {
        self.span
    }

    /// Whether the block is free.
    pub fn is_free(&self) -> bool {
        self.is_free
    }

    /// Header of the previous block in the page.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    /// Header of the next block in the page.
    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

impl fmt::Display for BlockUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_free { "free" } else { "allocated" };
        write!(
            f,
            "{:#x} (+{}): {state}, size {}, span {}",
            self.address, self.offset, self.size, self.span
        )
    }
}
