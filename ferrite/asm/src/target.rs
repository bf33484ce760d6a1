//! The per-CPU backend interface.
//!
//! Everything machine-specific sits behind [`TargetOps`]: tokenizing and
//! encoding instructions, estimating and converting relaxable frags,
//! patching fixed-up fields, and choosing output relocation kinds. The
//! active backend is registered explicitly at startup and passed alongside
//! the [`Assembler`] context; it never reaches into assembler internals the
//! context does not hand it.

pub mod falcon;

use crate::context::{Assembler, Endian};
use crate::expr::Expr;
use crate::fixup::{Fixup, FixupId};
use crate::frag::FragId;
use crate::relax::RelaxEntry;
use crate::section::SectionId;
use crate::source::{Cursor, SourceLoc};
use bitflags::bitflags;
use core::fmt;

/// Relocation kinds: the union over every supported backend, plus a
/// catch-all for kinds only meaningful to one target's operand tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Absolute 1-byte.
    Abs8,
    /// Absolute 2-byte.
    Abs16,
    /// Absolute 4-byte.
    Abs32,
    /// Absolute 8-byte.
    Abs64,
    /// PC-relative 1-byte.
    PcRel8,
    /// PC-relative 2-byte.
    PcRel16,
    /// PC-relative 4-byte.
    PcRel32,
    /// 4-byte image-relative (RVA).
    Rva32,
    /// Low 16 bits of a 32-bit value.
    Lo16,
    /// High 16 bits of a 32-bit value.
    Hi16,
    /// High 16 bits, adjusted for sign carry from the low half.
    Ha16,
    /// 26-bit branch displacement.
    Branch26,
    /// Target-specific; the backend's operand table decides the layout.
    TargetOperand(u16),
}

impl RelocKind {
    /// Width of the relocated field in bytes.
    pub fn size_bytes(self) -> u8 {
        match self {
            RelocKind::Abs8 | RelocKind::PcRel8 => 1,
            RelocKind::Abs16 | RelocKind::PcRel16 | RelocKind::Lo16 | RelocKind::Hi16
            | RelocKind::Ha16 => 2,
            RelocKind::Abs64 => 8,
            _ => 4,
        }
    }

    /// Is the field relative to the relocation site?
    pub fn is_pcrel(self) -> bool {
        matches!(
            self,
            RelocKind::PcRel8 | RelocKind::PcRel16 | RelocKind::PcRel32 | RelocKind::Branch26
        )
    }
}

impl fmt::Display for RelocKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelocKind::Abs8 => write!(f, "Abs8"),
            RelocKind::Abs16 => write!(f, "Abs16"),
            RelocKind::Abs32 => write!(f, "Abs32"),
            RelocKind::Abs64 => write!(f, "Abs64"),
            RelocKind::PcRel8 => write!(f, "PCRel8"),
            RelocKind::PcRel16 => write!(f, "PCRel16"),
            RelocKind::PcRel32 => write!(f, "PCRel32"),
            RelocKind::Rva32 => write!(f, "RVA32"),
            RelocKind::Lo16 => write!(f, "Lo16"),
            RelocKind::Hi16 => write!(f, "Hi16"),
            RelocKind::Ha16 => write!(f, "Ha16"),
            RelocKind::Branch26 => write!(f, "Branch26"),
            RelocKind::TargetOperand(n) => write!(f, "TargetOperand({n})"),
        }
    }
}

bitflags! {
    /// Flags describing one instruction operand field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperandFlags: u32 {
        /// The field is a signed quantity.
        const SIGNED = 0x0001;
        /// The value is negated before insertion.
        const NEGATIVE = 0x0002;
        /// The field is relative to the instruction address.
        const PCREL = 0x0004;
        /// The operand must be wrapped in parentheses.
        const PARENS = 0x0008;
        /// The operand does not consume source text.
        const FAKE = 0x0010;
        /// Skip the range check for this field.
        const NO_OVERFLOW = 0x0020;
        /// The operand names a register.
        const REGISTER = 0x0040;
        /// Absent operand defaults to the value of operand 1.
        const DEFAULT1 = 0x0080;
        /// Absent operand defaults to the value of operand 2.
        const DEFAULT2 = 0x0100;
    }
}

/// Description of one operand field within an instruction word.
#[derive(Debug, Clone, Copy)]
pub struct OperandDesc {
    /// Field width in bits.
    pub bits: u8,
    /// Left shift applied when inserting into the word.
    pub shift: u8,
    /// Right shift applied to the value first (word-scaled displacements).
    pub scale: u8,
    /// Field flags.
    pub flags: OperandFlags,
    /// Relocation kind used when the operand cannot be resolved now.
    pub reloc: Option<RelocKind>,
}

impl OperandDesc {
    /// Insert `val` into `insn` per this descriptor, range-checking first.
    pub fn insert(&self, asm: &mut Assembler, loc: SourceLoc, insn: u32, val: i64) -> u32 {
        let mut test = val;
        if self.flags.contains(OperandFlags::NEGATIVE) {
            test = -test;
        }
        if self.bits < 32 && !self.flags.contains(OperandFlags::NO_OVERFLOW) {
            let (min, max): (i64, i64) = if self.flags.contains(OperandFlags::SIGNED) {
                (-(1 << (self.bits - 1)), (1 << (self.bits - 1)) - 1)
            } else {
                (0, (1 << self.bits) - 1)
            };
            let scaled = test >> self.scale;
            if scaled < min || scaled > max {
                asm.diag.warn(
                    loc,
                    format!("operand out of range ({scaled} not between {min} and {max})"),
                );
            }
        }
        let mask: u32 = if self.bits >= 32 {
            !0
        } else {
            (1u32 << self.bits) - 1
        };
        let field = ((test >> self.scale) as u32) & mask;
        insn | (field << self.shift)
    }
}

/// Per-CPU hooks every backend must provide.
pub trait TargetOps {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Byte order when the command line does not choose one.
    fn default_endian(&self) -> Endian {
        Endian::Little
    }

    /// Assemble one instruction statement. The mnemonic is at the cursor.
    fn assemble(&self, asm: &mut Assembler, cur: &mut Cursor);

    /// Give the backend a chance at an operand the core cannot parse
    /// (register syntax, operand modifiers). Returns `None` to decline, in
    /// which case the cursor must be unmoved.
    fn parse_operand(&self, _asm: &mut Assembler, _cur: &mut Cursor) -> Option<Expr> {
        None
    }

    /// Initial size estimate for a machine-dependent frag, before any
    /// relaxation pass has run. May create fixups for shapes that will
    /// never resolve locally.
    fn estimate_size_before_relax(
        &self,
        _asm: &mut Assembler,
        _frag: FragId,
        _section: SectionId,
    ) -> u64 {
        0
    }

    /// Custom relaxation for one frag; return the growth in bytes, or
    /// `None` to use the generic table walk over [`relax_table`].
    ///
    /// [`relax_table`]: TargetOps::relax_table
    fn relax_frag(&self, _asm: &mut Assembler, _frag: FragId, _stretch: i64) -> Option<i64> {
        None
    }

    /// The generic relaxation state table. Row 0 must be unused (state 0
    /// terminates the `next` chain).
    fn relax_table(&self) -> &'static [RelaxEntry] {
        &[]
    }

    /// Commit a relaxed machine-dependent frag to its final bytes.
    fn convert_frag(&self, _asm: &mut Assembler, _section: SectionId, _frag: FragId) {}

    /// Patch the bytes of a fixed-up field with `value`. The default
    /// handles plain sized integer fields in the target byte order.
    fn apply_fix(&self, asm: &mut Assembler, fixup: FixupId, value: i64) {
        let f = asm.fixups[fixup].clone();
        let endian = asm.opts.endian.unwrap_or(self.default_endian());
        let frag = &mut asm.frags[f.frag];
        let end = f.where_ + f.size as usize;
        if end <= frag.literal.len() {
            crate::write::number_to_chars(
                &mut frag.literal[f.where_..end],
                value as u64,
                endian,
            );
        }
    }

    /// Choose the on-disk relocation kind for an unresolved fixup, or
    /// `None` if the target cannot represent it (an error is reported).
    fn gen_reloc(&self, _asm: &Assembler, fixup: &Fixup) -> Option<RelocKind> {
        Some(fixup.kind)
    }

    /// The address a pc-relative field is measured from.
    fn pcrel_from(&self, asm: &Assembler, fixup: &Fixup) -> u64 {
        asm.frags[fixup.frag].address + fixup.where_ as u64
    }

    /// Force an output relocation even for a locally resolvable fixup.
    fn force_reloc(&self, _asm: &Assembler, _fixup: &Fixup) -> bool {
        false
    }

    /// Warn when a 2-byte data value exceeds the signed range.
    fn signed_overflow_word_check(&self) -> bool {
        false
    }

    /// Line-comment character.
    fn comment_char(&self) -> u8 {
        b'#'
    }

    /// Statement separator character.
    fn separator_char(&self) -> u8 {
        b';'
    }

    /// Fill pattern for code alignment.
    fn align_code_fill(&self) -> &[u8] {
        &[0]
    }
}

/// A do-nothing backend: data directives work, instructions are diagnosed.
/// Used by tests and by format-only tools.
struct NullTarget;

impl TargetOps for NullTarget {
    fn name(&self) -> &'static str {
        "null"
    }

    fn assemble(&self, asm: &mut Assembler, cur: &mut Cursor) {
        let mnemonic = cur.take_name().unwrap_or("?").to_string();
        asm.error(format!("unknown opcode `{mnemonic}'"));
    }
}

/// Create the do-nothing backend.
pub fn null_target() -> Box<dyn TargetOps> {
    Box::new(NullTarget)
}

/// Create the backend registered under `name`, if any.
pub fn lookup(name: &str) -> Option<Box<dyn TargetOps>> {
    match name {
        "falcon" => Some(Box::new(falcon::Falcon::new())),
        "null" => Some(null_target()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;

    #[test]
    fn insert_operand_range() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let desc = OperandDesc {
            bits: 8,
            shift: 8,
            scale: 0,
            flags: OperandFlags::SIGNED,
            reloc: None,
        };
        let loc = SourceLoc::default();
        let insn = desc.insert(&mut asm, loc, 0, -2);
        assert_eq!(insn, 0xfe00);
        assert_eq!(asm.diag.warning_count(), 0);

        desc.insert(&mut asm, loc, 0, 1000);
        assert_eq!(asm.diag.warning_count(), 1);
    }

    #[test]
    fn insert_operand_scaled() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let desc = OperandDesc {
            bits: 16,
            shift: 0,
            scale: 2,
            flags: OperandFlags::SIGNED | OperandFlags::PCREL,
            reloc: Some(RelocKind::PcRel16),
        };
        let insn = desc.insert(&mut asm, SourceLoc::default(), 0xABCD0000, -8);
        assert_eq!(insn & 0xffff, 0xfffe);
        assert_eq!(insn & 0xffff0000, 0xABCD0000);
    }
}
