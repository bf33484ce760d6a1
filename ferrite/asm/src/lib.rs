//! Assembler pipeline core.
//!
//! This crate turns a stream of assembly statements into the pieces of an
//! object file: section contents, a symbol table, and relocations. The
//! pipeline runs in three strictly ordered phases:
//!
//! 1. **Parse**: [`read`] consumes statements, evaluating expressions
//!    ([`expr`]), defining symbols ([`symbol`]), and appending frags
//!    ([`frag`]) to the current subsegment. Instructions are handed to the
//!    active [`target::TargetOps`] backend, which emits bytes and pending
//!    [`fixup`]s.
//! 2. **Relax**: [`relax`] iterates over the chained frags of every section
//!    until each variable-size frag has settled on its final encoding.
//! 3. **Write**: [`write`] resolves symbols, applies fixups, and serializes
//!    the result through an [`write::ObjectWriter`] implementation.
//!
//! There is no concurrency anywhere in the pipeline; the phases communicate
//! only through the [`Assembler`] context, which gathers the state the
//! classic implementations kept in globals.
//!
//! Recoverable syntax problems are reported through [`diag::Diagnostics`]
//! and assembly continues with a zero value substituted; hard failures
//! (I/O, internal invariant violations) are [`AsmError`]s and abort the run.

mod fx;

pub mod context;
pub mod diag;
pub mod expr;
pub mod fixup;
pub mod frag;
pub mod intern;
pub mod read;
pub mod relax;
pub mod section;
pub mod source;
pub mod symbol;
pub mod target;
pub mod write;

pub use crate::context::{AsmOptions, Assembler, Endian};
pub use crate::diag::Diagnostics;
pub use crate::source::SourceLoc;

use std::path::PathBuf;
use thiserror::Error;

/// A hard assembler failure. Unlike the diagnostics in [`diag`], these abort
/// the current run: parse errors never surface here, but a broken output
/// file, an unreadable input, or a violated internal invariant does.
#[derive(Debug, Error)]
pub enum AsmError {
    /// An input file could not be read.
    #[error("can't open `{path}` for reading: {source}")]
    Input {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing the output object failed.
    #[error("error writing output: {0}")]
    Write(#[from] crate::write::WriteError),

    /// A `.abort` directive or an abort-worthy condition was reached.
    #[error("assembly aborted: {0}")]
    Aborted(String),

    /// An internal invariant was violated; no output file is produced.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result type for assembler operations.
pub type AsmResult<T> = Result<T, AsmError>;
