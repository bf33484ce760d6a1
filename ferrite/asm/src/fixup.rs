//! Fixups: deferred patches to emitted bytes.
//!
//! A fixup remembers a place in a frag, the expression that should end up
//! there, and the relocation kind to fall back on if the value cannot be
//! computed at assembly time. At write time `fixup_segment` walks each
//! section's fixups in source order, reduces what it can to plain numbers,
//! range-checks the result against the field width, and lets the target
//! patch the bytes. Whatever is still unresolved becomes an output
//! relocation.

use crate::context::Assembler;
use crate::expr::{Expr, ExprValue};
use crate::frag::FragId;
use crate::section::SectionId;
use crate::source::SourceLoc;
use crate::symbol::{Segment, SymbolFlags, SymbolId};
use crate::target::{RelocKind, TargetOps};
use ferrite_entity::entity_impl;

/// An opaque reference to a fixup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixupId(u32);
entity_impl!(FixupId, "fix");

/// A pending patch.
#[derive(Debug, Clone)]
pub struct Fixup {
    /// Frag holding the bytes to patch.
    pub frag: FragId,
    /// Byte offset of the field within the frag.
    pub where_: usize,
    /// Field size in bytes.
    pub size: u8,
    /// Symbol whose value is added.
    pub addsy: Option<SymbolId>,
    /// Symbol whose value is subtracted.
    pub subsy: Option<SymbolId>,
    /// Additive constant.
    pub offset: i64,
    /// Final computed value, stored for relocation generation.
    pub addnumber: i64,
    /// PC-relative field.
    pub pcrel: bool,
    /// Must go through the procedure linkage table.
    pub plt: bool,
    /// Fully applied; no relocation needed.
    pub done: bool,
    /// Suppress the generic range check.
    pub no_overflow: bool,
    /// Relocation kind to emit if unresolved.
    pub kind: RelocKind,
    /// Where the fixup was created.
    pub loc: SourceLoc,
}

impl Assembler {
    /// Create a fixup for `symbol + offset` at `(frag, where_)`.
    #[allow(clippy::too_many_arguments)]
    pub fn fix_new(
        &mut self,
        frag: FragId,
        where_: usize,
        size: u8,
        addsy: Option<SymbolId>,
        offset: i64,
        pcrel: bool,
        kind: RelocKind,
    ) -> FixupId {
        self.fix_new_internal(frag, where_, size, addsy, None, offset, pcrel, kind)
    }

    /// Lower a parsed expression into a fixup. Only the handful of shapes a
    /// relocation can express are accepted directly; an `Add` node is first
    /// reduced through an expression symbol, and anything else is an error.
    #[allow(clippy::too_many_arguments)]
    pub fn fix_new_exp(
        &mut self,
        frag: FragId,
        where_: usize,
        size: u8,
        exp: &Expr,
        pcrel: bool,
        kind: RelocKind,
    ) -> FixupId {
        let mut kind = kind;
        let (addsy, subsy, offset) = match &exp.value {
            ExprValue::Absent => (None, None, 0),
            ExprValue::Constant(v) => (None, None, *v),
            ExprValue::Symbol { sym, add } => (Some(*sym), None, *add),
            ExprValue::SymbolRva { sym, add } => {
                kind = RelocKind::Rva32;
                (Some(*sym), None, *add)
            }
            ExprValue::Unary {
                op: crate::expr::UnaryOp::Minus,
                sym,
                add,
            } => (None, Some(*sym), *add),
            ExprValue::Binary {
                op: crate::expr::BinaryOp::Sub,
                lhs,
                rhs,
                add,
            } => (Some(*lhs), Some(*rhs), *add),
            ExprValue::Binary {
                op: crate::expr::BinaryOp::Add,
                ..
            } => {
                // Reduce `a + b` through an expression symbol and retry.
                let sym = crate::expr::make_expr_symbol(self, exp);
                let reduced = Expr::symbol(sym);
                return self.fix_new_exp(frag, where_, size, &reduced, pcrel, kind);
            }
            _ => {
                self.error("expression too complex for fixup");
                (None, None, 0)
            }
        };
        self.fix_new_internal(frag, where_, size, addsy, subsy, offset, pcrel, kind)
    }

    #[allow(clippy::too_many_arguments)]
    fn fix_new_internal(
        &mut self,
        frag: FragId,
        where_: usize,
        size: u8,
        addsy: Option<SymbolId>,
        subsy: Option<SymbolId>,
        offset: i64,
        pcrel: bool,
        kind: RelocKind,
    ) -> FixupId {
        let loc = self.sources.here();
        let id = self.fixups.push(Fixup {
            frag,
            where_,
            size,
            addsy,
            subsy,
            offset,
            addnumber: 0,
            pcrel,
            plt: false,
            done: false,
            no_overflow: false,
            kind,
            loc,
        });

        // Until the subseg chains are concatenated, fixups belong to the
        // open subsegment; afterwards they go straight onto the section.
        if self.frags_chained {
            if let Some(section) = self.now_section() {
                self.sections[section].fixups.push(id);
            }
        } else if let Some(subseg) = self.now_subseg {
            self.subsegs[subseg].fixups.push(id);
        }
        id
    }
}

/// Resolve the fixups of `section`: fold symbol values into the addend
/// where possible, apply the patches, and return how many output
/// relocations remain.
pub fn fixup_segment(asm: &mut Assembler, target: &dyn TargetOps, section: SectionId) -> usize {
    let this_seg = Segment::Section(section);
    let fixups = asm.sections[section].fixups.clone();

    for id in fixups {
        let loc = asm.fixups[id].loc;
        let size = asm.fixups[id].size as usize;
        let mut pcrel = asm.fixups[id].pcrel;
        let plt = asm.fixups[id].plt;
        let mut add_number = asm.fixups[id].offset;

        // An MRI common member stands for its block plus an offset.
        if let Some(addsy) = asm.fixups[id].addsy {
            if asm.symbols.syms[addsy].flags.contains(SymbolFlags::MRI_COMMON) {
                if let ExprValue::Symbol { sym, add } = asm.symbols.syms[addsy].value.value {
                    add_number += add;
                    asm.fixups[id].offset = add_number;
                    asm.fixups[id].addsy = Some(sym);
                }
            }
        }

        let addsy = asm.fixups[id].addsy;
        let subsy = asm.fixups[id].subsy;
        let add_seg = addsy.map(|s| asm.symbols.syms[s].segment);

        if let Some(sub) = subsy {
            let sub_val = asm.resolve_symbol(sub);
            let sub_seg = asm.symbols.syms[sub].segment;

            if addsy.is_none() || add_seg == Some(Segment::Absolute) {
                if let Some(add) = addsy {
                    add_number += asm.resolve_symbol(add);
                    asm.fixups[id].addsy = None;
                }
                if sub_seg == Segment::Absolute {
                    add_number -= sub_val;
                    asm.fixups[id].subsy = None;
                } else {
                    let name = asm.names.resolve(asm.symbols.syms[sub].name).to_string();
                    asm.diag
                        .error(loc, format!("negative of non-absolute symbol {name}"));
                }
            } else if Some(sub_seg) == add_seg && add_seg.map(Segment::is_normal).unwrap_or(false) {
                // Difference of two symbols from the same segment reduces
                // to a plain number.
                let add = addsy.unwrap();
                add_number += asm.resolve_symbol(add) - sub_val;
                asm.fixups[id].addsy = None;
                asm.fixups[id].subsy = None;
                asm.fixups[id].pcrel = false;
                pcrel = false;
            } else if sub_seg == Segment::Absolute {
                add_number -= sub_val;
                asm.fixups[id].subsy = None;
            } else if sub_seg == this_seg {
                // Re-express as pc-relative from the fixup site.
                let from = target.pcrel_from(asm, &asm.fixups[id]);
                add_number += from as i64 - sub_val;
                pcrel = true;
                asm.fixups[id].pcrel = true;
                asm.fixups[id].subsy = None;
            } else if asm.opts.pic {
                // Position-independent output may keep the difference of an
                // undefined symbol for the linker.
            } else {
                let frag_addr = asm.frags[asm.fixups[id].frag].address;
                let name = asm.names.resolve(asm.symbols.syms[sub].name).to_string();
                let seg_name = asm.segment_name(sub_seg);
                asm.diag.error(
                    loc,
                    format!(
                        "can't emit reloc {{- {seg_name}-segment symbol \"{name}\"}} @ file address {}",
                        frag_addr + asm.fixups[id].where_ as u64
                    ),
                );
            }
        }

        if let Some(add) = asm.fixups[id].addsy {
            let seg = asm.symbols.syms[add].segment;
            if seg == this_seg && pcrel && !plt {
                // Fixup against our own segment: the address arithmetic is
                // complete once the pc bias is removed.
                add_number += asm.resolve_symbol(add);
                add_number -= target.pcrel_from(asm, &asm.fixups[id]) as i64;
                pcrel = false;
                if !target.force_reloc(asm, &asm.fixups[id]) {
                    asm.fixups[id].pcrel = false;
                    asm.fixups[id].addsy = None;
                }
            } else if seg == Segment::Absolute {
                add_number += asm.resolve_symbol(add);
                if !target.force_reloc(asm, &asm.fixups[id]) {
                    asm.fixups[id].addsy = None;
                }
            } else if seg == Segment::Undefined || seg == Segment::Common {
                // Leave the symbol for the relocation.
            } else {
                // Defined somewhere we can name. External symbols keep
                // only the addend in the bytes; the linker supplies the
                // address. Locals carry the section-relative value, the
                // same convention section symbols use.
                let s = &asm.symbols.syms[add];
                if !s.is_external() && !s.flags.contains(SymbolFlags::WEAK) {
                    add_number += asm.resolve_symbol(add);
                }
            }
        }

        if pcrel {
            add_number -= target.pcrel_from(asm, &asm.fixups[id]) as i64;
            if asm.fixups[id].addsy.is_none() {
                // Latch the absolute section so the reloc has a target.
                let abs = asm.symbol_find_or_make("*ABS*");
                asm.symbols.syms[abs].segment = Segment::Absolute;
                asm.symbols.syms[abs]
                    .flags
                    .insert(SymbolFlags::USED_IN_RELOC);
                asm.fixups[id].addsy = Some(abs);
            }
        }

        // Generic range check: the value must fit the field as either a
        // signed or an unsigned quantity.
        if !asm.fixups[id].no_overflow && size > 0 && size < 8 {
            let mask: u64 = !0u64 << (size * 8);
            let bits = add_number as u64;
            if (bits & mask) != 0 && (bits & mask) != mask {
                let frag_addr = asm.frags[asm.fixups[id].frag].address;
                asm.diag.error(
                    loc,
                    format!(
                        "value of {add_number} too large for field of {size} bytes at {:#x}",
                        frag_addr + asm.fixups[id].where_ as u64
                    ),
                );
            }
            if target.signed_overflow_word_check()
                && !asm.opts.signed_overflow_ok
                && size == 2
                && add_number > 0x7fff
            {
                asm.diag.warn(
                    loc,
                    format!("signed .word overflow; value {add_number} at {:#x}", {
                        asm.frags[asm.fixups[id].frag].address + asm.fixups[id].where_ as u64
                    }),
                );
            }
        }

        asm.fixups[id].addnumber = add_number;
        if !asm.fixups[id].done {
            target.apply_fix(asm, id, add_number);
            if asm.fixups[id].addsy.is_none() && !asm.fixups[id].pcrel {
                asm.fixups[id].done = true;
            }
        }
    }

    // Everything still pending becomes an output relocation.
    let count = asm.sections[section]
        .fixups
        .iter()
        .filter(|&&id| !asm.fixups[id].done)
        .count();
    asm.sections[section].reloc_count = count;
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::expr::BinaryOp;
    use crate::target::null_target;

    #[test]
    fn exp_shapes() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let (frag, at) = asm.frag_more(4);

        let c = Expr::constant(42);
        let f = asm.fix_new_exp(frag, at, 4, &c, false, RelocKind::Abs32);
        assert_eq!(asm.fixups[f].offset, 42);
        assert!(asm.fixups[f].addsy.is_none());

        let s = asm.symbol_find_or_make("ext");
        let e = Expr::symbol(s);
        let f = asm.fix_new_exp(frag, at, 4, &e, false, RelocKind::Abs32);
        assert_eq!(asm.fixups[f].addsy, Some(s));

        let t = asm.symbol_find_or_make("other");
        let diff = Expr {
            value: ExprValue::Binary {
                op: BinaryOp::Sub,
                lhs: s,
                rhs: t,
                add: 7,
            },
            unsigned: true,
        };
        let f = asm.fix_new_exp(frag, at, 4, &diff, false, RelocKind::Abs32);
        assert_eq!(asm.fixups[f].addsy, Some(s));
        assert_eq!(asm.fixups[f].subsy, Some(t));
        assert_eq!(asm.fixups[f].offset, 7);
    }

    #[test]
    fn too_complex_diagnosed() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let (frag, at) = asm.frag_more(4);
        let a = asm.symbol_find_or_make("a");
        let b = asm.symbol_find_or_make("b");
        let mul = Expr {
            value: ExprValue::Binary {
                op: BinaryOp::Mul,
                lhs: a,
                rhs: b,
                add: 0,
            },
            unsigned: true,
        };
        asm.fix_new_exp(frag, at, 4, &mul, false, RelocKind::Abs32);
        assert_eq!(asm.diag.error_count(), 1);
    }

    #[test]
    fn same_segment_difference_resolves() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let target = null_target();

        asm.colon("a");
        let (frag, at) = asm.frag_more(4);
        asm.colon("b");
        let a = asm.symbol_find("a").unwrap();
        let b = asm.symbol_find("b").unwrap();
        let diff = Expr {
            value: ExprValue::Binary {
                op: BinaryOp::Sub,
                lhs: b,
                rhs: a,
                add: 0,
            },
            unsigned: true,
        };
        let f = asm.fix_new_exp(frag, at, 4, &diff, false, RelocKind::Abs32);

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        let n = fixup_segment(&mut asm, &*target, text);
        assert_eq!(n, 0);
        assert!(asm.fixups[f].done);
        assert_eq!(asm.fixups[f].addnumber, 4);
        assert_eq!(asm.diag.error_count(), 0);
    }

    #[test]
    fn undefined_symbol_counts_reloc() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let target = null_target();
        let ext = asm.symbol_find_or_make("ext");
        let (frag, at) = asm.frag_more(4);
        let e = Expr::symbol(ext);
        asm.fix_new_exp(frag, at, 4, &e, false, RelocKind::Abs32);
        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        assert_eq!(fixup_segment(&mut asm, &*target, text), 1);
    }
}
