//! The COFF linker core.
//!
//! Linking runs in two broad stages. Loading ([`input`], [`archive`])
//! decodes each object, merges its external symbols into the global link
//! hash ([`hash`]), and pulls archive members in by undefined-symbol
//! demand. The final link ([`link`]) walks the output sections'
//! link-order lists: every input section is copied with its local symbols
//! renumbered, its line numbers rebased, and its relocations either
//! applied ([`reloc`]) or rewritten for relocatable output; globals are
//! written at the end, when their final indices are known, and relocs
//! held back for them are patched before the file is flushed.
//!
//! Debug-type merging ([`merge`]) and `.stab` string deduplication
//! ([`stabs`]) run as part of the copy.

pub mod archive;
pub mod buffer;
pub mod hash;
pub mod input;
pub mod link;
pub mod merge;
pub mod options;
pub mod plan;
pub mod reloc;
pub mod stabs;

pub use crate::hash::LinkHash;
pub use crate::input::LinkContext;
pub use crate::options::{LinkCallbacks, LinkOptions};

use thiserror::Error;

/// A hard linker failure; diagnostics that allow the link to continue go
/// through [`LinkCallbacks`] instead.
#[derive(Debug, Error)]
pub enum LinkError {
    /// An input could not be read or decoded.
    #[error("{path}: {source}")]
    Input {
        /// The offending file.
        path: String,
        /// Decode failure.
        source: ferrite_coff::ObjectError,
    },

    /// An archive was malformed.
    #[error("{path}: bad archive: {reason}")]
    BadArchive {
        /// The archive file.
        path: String,
        /// What was wrong.
        reason: String,
    },

    /// Errors were reported through the callbacks; the output was not
    /// written.
    #[error("link failed with {0} error(s)")]
    HadErrors(usize),

    /// A format limit was exceeded while writing.
    #[error("output format limit exceeded: {0}")]
    TooLarge(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
