//! The COFF-like object format.
//!
//! One representative object format, wire-exact where it matters: 20-byte
//! file header, 40-byte section headers (long names spill into the string
//! table as `/<decimal-offset>`), 18-byte symbol entries with same-sized
//! auxiliary records, 10-byte relocations, 6-byte line numbers, and a
//! string table that begins with its own 4-byte length.
//!
//! [`read`] decodes files into internal structures for the linker;
//! [`write`] implements the assembler's object-writer interface over the
//! same layout. Both ends work in either byte order.

pub mod read;
pub mod types;
pub mod write;

mod encode;

pub use crate::read::CoffObject;
pub use crate::write::CoffWriter;

use thiserror::Error;

/// Size of the file header in bytes.
pub const FILHSZ: usize = 20;
/// Size of a section header in bytes.
pub const SCNHSZ: usize = 40;
/// Size of a symbol entry in bytes.
pub const SYMESZ: usize = 18;
/// Size of an auxiliary entry; must equal [`SYMESZ`].
pub const AUXESZ: usize = 18;
/// Size of a relocation entry in bytes.
pub const RELSZ: usize = 10;
/// Size of a line-number entry in bytes.
pub const LINESZ: usize = 6;
/// Inline symbol-name capacity.
pub const SYMNMLEN: usize = 8;
/// Inline section-name capacity.
pub const SCNNMLEN: usize = 8;

// Aux entries reuse the symbol-entry writer wholesale.
const _: () = assert!(SYMESZ == AUXESZ);

/// Magic number, little-endian byte order.
pub const MAGIC_LE: u16 = 0x01f0;
/// Magic number, big-endian byte order.
pub const MAGIC_BE: u16 = 0x01f1;

/// Relocation info stripped.
pub const F_RELFLG: u16 = 0x0001;
/// File is executable (no unresolved references).
pub const F_EXEC: u16 = 0x0002;
/// Line numbers stripped.
pub const F_LNNO: u16 = 0x0004;
/// Local symbols stripped.
pub const F_LSYMS: u16 = 0x0008;
/// Position-independent code.
pub const F_PIC: u16 = 0x4000;
/// Produced for a relocatable final link.
pub const F_RELOCATABLE: u16 = 0x2000;

/// Section number of an undefined symbol.
pub const N_UNDEF: i16 = 0;
/// Section number of an absolute symbol.
pub const N_ABS: i16 = -1;
/// Section number of a debugging symbol.
pub const N_DEBUG: i16 = -2;

/// No storage class.
pub const C_NULL: u8 = 0;
/// Automatic variable.
pub const C_AUTO: u8 = 1;
/// External symbol.
pub const C_EXT: u8 = 2;
/// Static symbol.
pub const C_STAT: u8 = 3;
/// Register variable.
pub const C_REG: u8 = 4;
/// Label.
pub const C_LABEL: u8 = 6;
/// Member of structure.
pub const C_MOS: u8 = 8;
/// Structure tag.
pub const C_STRTAG: u8 = 10;
/// Member of union.
pub const C_MOU: u8 = 11;
/// Union tag.
pub const C_UNTAG: u8 = 12;
/// Type definition.
pub const C_TPDEF: u8 = 13;
/// Enumeration tag.
pub const C_ENTAG: u8 = 15;
/// Member of enumeration.
pub const C_MOE: u8 = 16;
/// Beginning or end of a block (`.bb`/`.eb`).
pub const C_BLOCK: u8 = 100;
/// Beginning or end of a function (`.bf`/`.ef`).
pub const C_FCN: u8 = 101;
/// End of structure.
pub const C_EOS: u8 = 102;
/// File name symbol.
pub const C_FILE: u8 = 103;
/// Weak external.
pub const C_WEAKEXT: u8 = 127;

/// Section holds text.
pub const STYP_TEXT: u32 = 0x0020;
/// Section holds initialized data.
pub const STYP_DATA: u32 = 0x0040;
/// Section holds uninitialized data.
pub const STYP_BSS: u32 = 0x0080;
/// Comment/info section, not loaded.
pub const STYP_INFO: u32 = 0x0200;
/// Section is not loaded at run time.
pub const STYP_NOLOAD: u32 = 0x0002;
/// Read-only section.
pub const STYP_READONLY: u32 = 0x1000;

/// Derived-type shift for the `n_type` field.
pub const N_BTSHFT: u16 = 4;
/// Derived type: function.
pub const DT_FCN: u16 = 2;

/// Does this `n_type` describe a function?
pub fn is_function_type(ty: u16) -> bool {
    ((ty >> N_BTSHFT) & 3) == DT_FCN
}

/// Is this storage class a struct/union/enum tag?
pub fn is_tag_class(sclass: u8) -> bool {
    matches!(sclass, C_STRTAG | C_UNTAG | C_ENTAG)
}

/// Errors from reading or writing object files.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// The file is not in this format.
    #[error("not a recognized object file: {0}")]
    BadMagic(u16),

    /// Something in the file contradicts itself.
    #[error("malformed object file: {0}")]
    Malformed(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
