use std::io;

use thiserror::Error;

/// Errors reported by the memory manager.
///
/// Every misuse the manager can detect is reported through this type; no operation
/// aborts the process because of caller input.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A family was registered with an empty name.
    #[error("family name must not be empty")]
    EmptyName,

    /// A family name is longer than [`MAX_FAMILY_NAME_LEN`][crate::MAX_FAMILY_NAME_LEN].
    #[error("family name '{name}' is longer than {max} bytes")]
    NameTooLong {
        /// The rejected name.
        name: String,

        /// Maximum accepted length in bytes.
        max: usize,
    },

    /// A family was registered with an element size of zero.
    #[error("family '{name}' has a zero element size")]
    ZeroSizedElement {
        /// Name of the rejected family.
        name: String,
    },

    /// A single element of the family would not fit in one page.
    #[error("element size {element_size} of family '{name}' exceeds the page limit of {max}")]
    OversizedElement {
        /// Name of the rejected family.
        name: String,

        /// Requested element size in bytes.
        element_size: usize,

        /// Largest allocation one page can serve.
        max: usize,
    },

    /// A family with the same name is already registered.
    #[error("family '{name}' is already registered")]
    DuplicateFamily {
        /// Name of the existing family.
        name: String,
    },

    /// No family with this name has been registered.
    #[error("family '{name}' is not registered")]
    UnknownFamily {
        /// The name that was looked up.
        name: String,
    },

    /// An allocation asked for zero elements.
    #[error("requested zero units of family '{name}'")]
    ZeroUnits {
        /// Name of the family.
        name: String,
    },

    /// An allocation would not fit in one page.
    #[error(
        "request for {units} x {element_size} bytes of family '{name}' exceeds the limit of {max}"
    )]
    RequestTooLarge {
        /// Name of the family.
        name: String,

        /// Number of elements requested.
        units: usize,

        /// Element size of the family in bytes.
        element_size: usize,

        /// Largest allocation one page can serve.
        max: usize,
    },

    /// The pointer refers to a block that is already free.
    #[error("pointer {addr:#x} refers to a block that is already free")]
    DoubleFree {
        /// Address passed to `free`.
        addr: usize,
    },

    /// The pointer does not refer to the start of a block handed out by this manager.
    #[error("pointer {addr:#x} was not handed out by this memory manager")]
    ForeignPointer {
        /// Address passed to `free`.
        addr: usize,
    },

    /// The page source could not provide memory.
    #[error("failed to map {units} page(s)")]
    MapFailed {
        /// Number of pages requested.
        units: usize,

        /// Underlying operating system error.
        #[source]
        source: io::Error,
    },

    /// The page source could not take memory back.
    #[error("failed to unmap {units} page(s) at {addr:#x}")]
    UnmapFailed {
        /// Start of the region.
        addr: usize,

        /// Number of pages in the region.
        units: usize,

        /// Underlying operating system error.
        #[source]
        source: io::Error,
    },

    /// The page source reports a page size the manager cannot work with.
    #[error("page size {page_size} is not a power of two of at least {min} bytes")]
    InvalidPageSize {
        /// Page size reported by the page source.
        page_size: usize,

        /// Smallest supported page size.
        min: usize,
    },
}

/// A specialized `Result` type for memory manager operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_family() {
        let error = Error::UnknownFamily {
            name: "emp_t".to_string(),
        };
        assert_eq!(error.to_string(), "family 'emp_t' is not registered");

        let error = Error::RequestTooLarge {
            name: "student_t".to_string(),
            units: 100,
            element_size: 64,
            max: 4000,
        };
        assert!(error.to_string().contains("student_t"));
        assert!(error.to_string().contains("4000"));
    }

    #[test]
    fn map_failure_keeps_os_error() {
        use std::error::Error as _;

        let error = Error::MapFailed {
            units: 1,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };

        let source = error.source().expect("map failure has a source");
        let kind = source.downcast_ref::<io::Error>().map(io::Error::kind);
        assert_eq!(kind, Some(io::ErrorKind::OutOfMemory));
    }
}
