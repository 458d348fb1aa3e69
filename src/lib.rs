//! A slab memory manager on top of whole virtual memory pages.
//!
//! Callers first register a *family*, a named kind of element with a fixed size, and then
//! allocate some number of elements of it at a time. Every family gets its own pages:
//!
//! ```text
//!  Registry (descriptor pages)
//!  +------------------------------+
//!  | "emp_t" 36 | "student_t" 64  |
//!  +------------------------------+
//!        |              |
//!        v              v
//!  +-----------------+ +-----------------+    +-----------------+
//!  | VmPage | blocks | | VmPage | blocks | -> | VmPage | blocks |
//!  +-----------------+ +-----------------+    +-----------------+
//! ```
//!
//! Inside a page, allocations are carved out of free blocks, each preceded by a small
//! header. Freed blocks merge with free neighbours, and a page whose blocks are all free
//! goes straight back to the page source. Each family keeps its free blocks indexed by
//! size and always serves a request from the largest one, or from a new page if even that
//! one is too small.
//!
//! # Examples
//!
//! ```
//! use slabmm::{HeapPages, MemoryManager};
//!
//! let mut manager = MemoryManager::builder()
//!     .page_source(HeapPages::new(4096))
//!     .build()
//!     .unwrap();
//!
//! manager.register_family("emp_t", 36).unwrap();
//! manager.register_family("student_t", 64).unwrap();
//!
//! let students = manager.allocate("student_t", 4).unwrap();
//!
//! // The memory is zeroed.
//! let bytes = unsafe { std::slice::from_raw_parts(students.as_ptr(), 4 * 64) };
//! assert!(bytes.iter().all(|byte| *byte == 0));
//!
//! let usage = manager.dump_usage(Some("student_t")).unwrap();
//! assert_eq!(usage.families()[0].allocated_blocks(), 1);
//!
//! manager.free(students).unwrap();
//!
//! // The page held nothing else, so it is gone.
//! let usage = manager.dump_usage(Some("student_t")).unwrap();
//! assert!(usage.families()[0].pages().is_empty());
//! ```
//!
//! Allocations never span pages: a request must fit in
//! [`MemoryManager::max_allocation`] bytes.

mod block;
mod builder;
mod drop_policy;
mod error;
mod family;
mod freelist;
mod kernel;
mod list;
mod manager;
mod page;
mod registry;
mod report;
mod utils;

pub use block::BLOCK_HEADER_SIZE;
pub use builder::MemoryManagerBuilder;
pub use drop_policy::DropPolicy;
pub use error::{Error, Result};
pub use family::MAX_FAMILY_NAME_LEN;
pub use kernel::{HeapPages, MIN_PAGE_SIZE, OsPages, PageSource, page_size};
pub use manager::MemoryManager;
pub use page::PAGE_HEADER_SIZE;
pub use report::{
    BlockUsage, FamilyInfo, FamilyUsage, FreeBlockUsage, PageUsage, RegistryReport,
    UsageReport,
};
