//! The falcon backend: a small 32-bit RISC used to exercise the whole
//! pipeline.
//!
//! Fixed-size instructions are one 32-bit word with register fields at bits
//! 21/16/11 and a 16-bit immediate or displacement in the low half.
//! Conditional branches (`bne`, `beq`) carry a word-scaled 16-bit
//! pc-relative displacement measured from the end of the instruction. The
//! unconditional `b` is variable-length: a 2-byte short form with an 8-bit
//! byte displacement, relaxing to a 6-byte form holding a 32-bit absolute
//! target.

use crate::context::{Assembler, Endian};
use crate::expr::ExprValue;
use crate::fixup::{Fixup, FixupId};
use crate::frag::{FragId, FragKind};
use crate::fx::FxHashMap;
use crate::relax::RelaxEntry;
use crate::section::SectionId;
use crate::source::Cursor;
use crate::symbol::Segment;
use crate::target::{OperandDesc, OperandFlags, RelocKind, TargetOps};
use crate::write::number_to_chars;

/// Relax state: 2-byte branch with an 8-bit displacement.
const STATE_SHORT: u32 = 1;
/// Relax state: 6-byte branch with a 32-bit absolute target.
const STATE_LONG: u32 = 2;

/// Row 0 unused; the short form reaches +/-128 bytes, the long form
/// everything.
static RELAX_TABLE: &[RelaxEntry] = &[
    RelaxEntry {
        forward: 0,
        backward: 0,
        length: 0,
        next: 0,
    },
    RelaxEntry {
        forward: 127,
        backward: -128,
        length: 2,
        next: STATE_LONG,
    },
    RelaxEntry {
        forward: i64::MAX / 2,
        backward: i64::MIN / 2,
        length: 6,
        next: 0,
    },
];

/// Opcode byte of the short branch form.
const OP_B_SHORT: u8 = 0xE8;
/// First byte of the long branch form.
const OP_B_LONG: u8 = 0xE9;

const RD: OperandDesc = OperandDesc {
    bits: 5,
    shift: 21,
    scale: 0,
    flags: OperandFlags::REGISTER,
    reloc: None,
};
const RA: OperandDesc = OperandDesc {
    bits: 5,
    shift: 16,
    scale: 0,
    flags: OperandFlags::REGISTER,
    reloc: None,
};
const RB: OperandDesc = OperandDesc {
    bits: 5,
    shift: 11,
    scale: 0,
    flags: OperandFlags::REGISTER,
    reloc: None,
};
const RA_PARENS: OperandDesc = OperandDesc {
    bits: 5,
    shift: 16,
    scale: 0,
    flags: OperandFlags::REGISTER.union(OperandFlags::PARENS),
    reloc: None,
};
const SIMM16: OperandDesc = OperandDesc {
    bits: 16,
    shift: 0,
    scale: 0,
    flags: OperandFlags::SIGNED,
    reloc: Some(RelocKind::Lo16),
};
const DISP16: OperandDesc = OperandDesc {
    bits: 16,
    shift: 0,
    scale: 0,
    flags: OperandFlags::SIGNED,
    reloc: Some(RelocKind::Lo16),
};
const BD16: OperandDesc = OperandDesc {
    bits: 16,
    shift: 0,
    scale: 2,
    flags: OperandFlags::SIGNED.union(OperandFlags::PCREL),
    reloc: Some(RelocKind::PcRel16),
};

struct Opcode {
    base: u32,
    operands: &'static [OperandDesc],
}

/// The falcon backend.
pub struct Falcon {
    opcodes: FxHashMap<&'static str, Opcode>,
}

impl Falcon {
    /// Build the backend, hashing the opcode table.
    pub fn new() -> Self {
        let mut opcodes = FxHashMap::default();
        let mut add = |name: &'static str, base: u32, operands: &'static [OperandDesc]| {
            opcodes.insert(name, Opcode { base, operands });
        };

        add("nop", 0x0000_0000, &[]);
        add("li", 0x0400_0000, &[RD, SIMM16]);
        add("add", 0x0800_0000, &[RD, RA, RB]);
        add("lw", 0x0C00_0000, &[RD, DISP16, RA_PARENS]);
        add("sw", 0x1000_0000, &[RD, DISP16, RA_PARENS]);
        add("bne", 0x2000_0000, &[RA, RB, BD16]);
        add("beq", 0x2400_0000, &[RA, RB, BD16]);

        Self { opcodes }
    }

    fn endian(&self, asm: &Assembler) -> Endian {
        asm.opts.endian.unwrap_or(Endian::Little)
    }

    fn parse_register(&self, asm: &mut Assembler, cur: &mut Cursor) -> Option<u32> {
        cur.skip_whitespace();
        let save = cur.pos();
        if asm.opts.regnames {
            if let Some(name) = cur.take_name() {
                if let Some(rest) = name.strip_prefix('r') {
                    if let Ok(n) = rest.parse::<u32>() {
                        if n < 32 {
                            return Some(n);
                        }
                    }
                }
                cur.set_pos(save);
                return None;
            }
        }
        // Bare register numbers are always accepted.
        let mut n: u32 = 0;
        let mut any = false;
        while let Some(c) = cur.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            n = n * 10 + (c - b'0') as u32;
            any = true;
            cur.bump();
        }
        if any && n < 32 {
            Some(n)
        } else {
            cur.set_pos(save);
            None
        }
    }

    /// Scan an `@l`/`@h`/`@ha` operand modifier after an expression.
    fn parse_modifier(&self, asm: &mut Assembler, cur: &mut Cursor) -> Option<RelocKind> {
        if !cur.eat(b'@') {
            return None;
        }
        if cur.eat_keyword("ha") {
            Some(RelocKind::Ha16)
        } else if cur.eat_keyword("h") {
            Some(RelocKind::Hi16)
        } else if cur.eat_keyword("l") {
            Some(RelocKind::Lo16)
        } else {
            asm.error("unsupported relocation modifier");
            None
        }
    }

    /// Patch a 16-bit field in the low half of a 32-bit instruction word.
    fn patch_low16(&self, asm: &mut Assembler, fixup: &Fixup, field: u16) {
        let endian = self.endian(asm);
        let at = match endian {
            Endian::Little => fixup.where_,
            Endian::Big => fixup.where_ + 2,
        };
        let frag = &mut asm.frags[fixup.frag];
        if at + 2 <= frag.literal.len() {
            number_to_chars(&mut frag.literal[at..at + 2], field as u64, endian);
        }
    }
}

impl Default for Falcon {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetOps for Falcon {
    fn name(&self) -> &'static str {
        "falcon"
    }

    fn assemble(&self, asm: &mut Assembler, cur: &mut Cursor) {
        let Some(mnemonic) = cur.take_name() else {
            asm.error("expected instruction mnemonic");
            return;
        };
        let mnemonic = mnemonic.to_ascii_lowercase();

        if mnemonic == "b" {
            self.assemble_branch(asm, cur);
            return;
        }

        let Some(op) = self.opcodes.get(mnemonic.as_str()) else {
            asm.error(format!("unknown opcode `{mnemonic}'"));
            return;
        };

        let loc = asm.here();
        let mut insn = op.base;
        // Fixups discovered while parsing operands; applied after the
        // instruction bytes exist.
        let mut pending: Vec<(crate::expr::Expr, OperandDesc)> = Vec::new();

        for (i, desc) in op.operands.iter().enumerate() {
            cur.skip_whitespace();
            if i > 0 && !desc.flags.contains(OperandFlags::PARENS) && !cur.eat(b',') {
                asm.error("missing operand");
                break;
            }
            if desc.flags.contains(OperandFlags::PARENS) {
                cur.skip_whitespace();
                if !cur.eat(b'(') {
                    asm.error("expected `(' before register operand");
                    break;
                }
            }
            cur.skip_whitespace();

            if desc.flags.contains(OperandFlags::REGISTER) {
                match self.parse_register(asm, cur) {
                    Some(r) => insn = desc.insert(asm, loc, insn, r as i64),
                    None => {
                        asm.error("expected register operand");
                        break;
                    }
                }
            } else {
                let (_, e) = crate::expr::expression(asm, self, cur);
                // A `@l`/`@h`/`@ha` suffix picks the half-word reloc.
                let modifier = self.parse_modifier(asm, cur);
                match &e.value {
                    ExprValue::Constant(v) => {
                        let v = match modifier {
                            Some(RelocKind::Lo16) => *v & 0xffff,
                            Some(RelocKind::Hi16) => (*v >> 16) & 0xffff,
                            Some(RelocKind::Ha16) => ((*v >> 16) + ((*v >> 15) & 1)) & 0xffff,
                            _ => *v,
                        };
                        // Selected halves are raw field bits, not signed
                        // quantities.
                        let mut desc = *desc;
                        if modifier.is_some() {
                            desc.flags = desc.flags.union(OperandFlags::NO_OVERFLOW);
                        }
                        insn = desc.insert(asm, loc, insn, v);
                    }
                    ExprValue::Register(_) => {
                        asm.error("register value used as expression");
                    }
                    ExprValue::Absent | ExprValue::Illegal => {
                        asm.error("missing operand");
                    }
                    ExprValue::Big(_) => {
                        asm.error("immediate operand is too large");
                    }
                    _ => {
                        let mut desc = *desc;
                        if let Some(kind) = modifier {
                            desc.reloc = Some(kind);
                        }
                        pending.push((e, desc));
                    }
                }
            }

            if desc.flags.contains(OperandFlags::PARENS) {
                cur.skip_whitespace();
                if !cur.eat(b')') {
                    asm.error("expected `)' after register operand");
                }
            }
        }

        let endian = self.endian(asm);
        let (frag, at) = asm.frag_more(4);
        number_to_chars(&mut asm.frags[frag].literal[at..at + 4], insn as u64, endian);

        for (e, desc) in pending {
            let kind = desc.reloc.unwrap_or(RelocKind::Abs32);
            let pcrel = desc.flags.contains(OperandFlags::PCREL);
            let id = asm.fix_new_exp(frag, at, 4, &e, pcrel, kind);
            if matches!(kind, RelocKind::Lo16 | RelocKind::Hi16 | RelocKind::Ha16) {
                asm.fixups[id].no_overflow = true;
            }
        }

        cur.skip_whitespace();
        if !cur.at_end() {
            let rest = cur.rest().to_string();
            asm.error(format!("junk at end of line: `{rest}'"));
        }
    }

    fn estimate_size_before_relax(
        &self,
        asm: &mut Assembler,
        frag: FragId,
        section: SectionId,
    ) -> u64 {
        let sym = asm.frags[frag].symbol;
        let local = sym
            .map(|s| asm.symbols.syms[s].segment == Segment::Section(section))
            .unwrap_or(false);
        if !local {
            // Out-of-section targets can never use the short form; commit
            // to the long encoding now.
            asm.frags[frag].subtype = STATE_LONG;
        }
        RELAX_TABLE[asm.frags[frag].subtype as usize].length as u64
    }

    fn relax_table(&self) -> &'static [RelaxEntry] {
        RELAX_TABLE
    }

    fn convert_frag(&self, asm: &mut Assembler, _section: SectionId, frag: FragId) {
        let subtype = asm.frags[frag].subtype;
        let fix = asm.frags[frag].fix;
        let insn_addr = asm.frags[frag].address + fix as u64;
        let sym = asm.frags[frag].symbol;
        let offset = asm.frags[frag].offset;
        let loc = asm.frags[frag].loc;

        match subtype {
            STATE_SHORT => {
                let target = sym.map(|s| asm.resolve_symbol(s)).unwrap_or(0) + offset;
                let disp = target - (insn_addr as i64 + 2);
                if !(-128..=127).contains(&disp) {
                    asm.diag
                        .warn(loc, format!("short branch displacement {disp} out of range"));
                }
                let f = &mut asm.frags[frag];
                f.literal.truncate(fix);
                f.literal.push(OP_B_SHORT);
                f.literal.push(disp as i8 as u8);
                f.fix += 2;
            }
            STATE_LONG => {
                {
                    let f = &mut asm.frags[frag];
                    f.literal.truncate(fix);
                    f.literal.push(OP_B_LONG);
                    f.literal.push(0);
                    f.literal.extend_from_slice(&[0; 4]);
                    f.fix += 6;
                }
                let id = asm.fix_new(frag, fix + 2, 4, sym, offset, false, RelocKind::Abs32);
                log::trace!("long branch reloc {:?}", asm.fixups[id].kind);
            }
            other => {
                let loc = asm.frags[frag].loc;
                asm.diag
                    .error(loc, format!("bad branch relaxation state {other}"));
            }
        }
    }

    fn apply_fix(&self, asm: &mut Assembler, fixup: FixupId, value: i64) {
        let f = asm.fixups[fixup].clone();
        match f.kind {
            RelocKind::PcRel16 => {
                self.patch_low16(asm, &f, ((value >> 2) & 0xffff) as u16);
            }
            RelocKind::Lo16 => {
                self.patch_low16(asm, &f, (value & 0xffff) as u16);
            }
            RelocKind::Hi16 => {
                self.patch_low16(asm, &f, ((value >> 16) & 0xffff) as u16);
            }
            RelocKind::Ha16 => {
                let adjusted = ((value >> 16) + ((value >> 15) & 1)) & 0xffff;
                self.patch_low16(asm, &f, adjusted as u16);
            }
            _ => {
                let endian = self.endian(asm);
                let frag = &mut asm.frags[f.frag];
                let end = f.where_ + f.size as usize;
                if end <= frag.literal.len() {
                    number_to_chars(&mut frag.literal[f.where_..end], value as u64, endian);
                }
            }
        }
    }

    fn pcrel_from(&self, asm: &Assembler, fixup: &Fixup) -> u64 {
        // Displacements are measured from the end of the 4-byte
        // instruction.
        asm.frags[fixup.frag].address + fixup.where_ as u64 + 4
    }

    fn align_code_fill(&self) -> &[u8] {
        // `nop` is all zeros in both byte orders.
        &[0, 0, 0, 0]
    }
}

impl Falcon {
    fn assemble_branch(&self, asm: &mut Assembler, cur: &mut Cursor) {
        let (_, e) = crate::expr::expression(asm, self, cur);
        let (sym, offset) = match &e.value {
            ExprValue::Symbol { sym, add } => (Some(*sym), *add),
            ExprValue::Constant(v) => (None, *v),
            _ => {
                let wrapped = crate::expr::make_expr_symbol(asm, &e);
                (Some(wrapped), 0)
            }
        };
        asm.frag_var(FragKind::MachineDependent, 6, &[], STATE_SHORT, sym, offset);

        cur.skip_whitespace();
        if !cur.at_end() {
            let rest = cur.rest().to_string();
            asm.error(format!("junk at end of line: `{rest}'"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::read;

    fn assemble(src: &str) -> (Assembler, Vec<u8>) {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let falcon = Falcon::new();
        asm.sources.push_file("t.s", src);
        read::read_source(&mut asm, &falcon).unwrap();

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        crate::relax::relax_segment(&mut asm, &falcon, text);
        crate::relax::convert_frags(&mut asm, &falcon, text);
        asm.now_seg = Segment::Section(text);
        crate::fixup::fixup_segment(&mut asm, &falcon, text);

        let mut bytes = Vec::new();
        let mut cur = asm.sections[text].frag_root;
        while let Some(id) = cur {
            let f = &asm.frags[id];
            bytes.extend_from_slice(&f.literal[..f.fix]);
            for _ in 0..f.offset {
                bytes.extend_from_slice(&f.literal[f.fix..f.fix + f.var as usize]);
            }
            cur = f.next;
        }
        (asm, bytes)
    }

    #[test]
    fn encodes_simple_instructions() {
        let (asm, bytes) = assemble("nop\nadd r1, r2, r3\nli r4, 0x1234\n");
        assert_eq!(asm.diag.error_count(), 0);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        let add = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(add, 0x0800_0000 | (1 << 21) | (2 << 16) | (3 << 11));
        let li = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(li, 0x0400_0000 | (4 << 21) | 0x1234);
    }

    #[test]
    fn load_store_parens() {
        let (asm, bytes) = assemble("lw r1, 8(r2)\nsw r3, -4(r4)\n");
        assert_eq!(asm.diag.error_count(), 0);
        let lw = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(lw, 0x0C00_0000 | (1 << 21) | (2 << 16) | 8);
        let sw = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(sw, 0x1000_0000 | (3 << 21) | (4 << 16) | 0xfffc);
    }

    #[test]
    fn backward_branch_resolves_in_place() {
        // `bne` at offset 8; displacement to `foo` at 0 is
        // (0 - (8 + 4)) / 4 = -3.
        let (asm, bytes) = assemble("foo: nop\nnop\nbne r1, r2, foo\n");
        assert_eq!(asm.diag.error_count(), 0);
        let bne = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(bne & 0xffff, (-3i16) as u16 as u32);
        // Resolved in place: no relocation survives.
        let pending = asm.sections[asm.text].reloc_count;
        assert_eq!(pending, 0);
    }

    #[test]
    fn short_branch_stays_short() {
        let (asm, bytes) = assemble("b fwd\nnop\nfwd: nop\n");
        assert_eq!(asm.diag.error_count(), 0);
        // Short form: 2 bytes, disp = 6 - 2 = 4.
        assert_eq!(bytes[0], OP_B_SHORT);
        assert_eq!(bytes[1], 4);
        assert_eq!(bytes.len(), 2 + 4 + 4);
        assert_eq!(asm.sections[asm.text].reloc_count, 0);
    }

    #[test]
    fn half_word_modifiers() {
        // Constants fold the half selection inline; symbols pick the
        // matching relocation kind.
        let (asm, bytes) = assemble("li r1, 0x12348000@h\nli r2, 0x12348000@ha\n");
        assert_eq!(asm.diag.error_count(), 0);
        let hi = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(hi & 0xffff, 0x1234);
        // The ha form carries the sign bit of the low half upward.
        let ha = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(ha & 0xffff, 0x1235);

        let (asm, _) = assemble("li r3, ext@h\n");
        assert_eq!(asm.diag.error_count(), 0);
        let pending: Vec<_> = asm
            .fixups
            .values()
            .filter(|f| !f.done)
            .map(|f| f.kind)
            .collect();
        assert_eq!(pending, vec![RelocKind::Hi16]);
    }

    #[test]
    fn far_branch_relaxes_to_long() {
        // 129 bytes of code between the branch and its target force the
        // long form on the second relaxation pass.
        let mut src = String::from("b far\n");
        for _ in 0..33 {
            src.push_str("nop\n");
        }
        src.push_str(".byte 0\nfar: nop\n");
        let (asm, bytes) = assemble(&src);
        assert_eq!(asm.diag.error_count(), 0);
        assert_eq!(bytes[0], OP_B_LONG);
        // 6-byte branch, then 33 nops + 1 byte, target at 6 + 133.
        assert_eq!(bytes.len(), 6 + 33 * 4 + 1 + 4);
        let target = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(target, 6 + 33 * 4 + 1);
        // The long form needs a relocation against the section.
        assert_eq!(asm.sections[asm.text].reloc_count, 1);
    }
}
