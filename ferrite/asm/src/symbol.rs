//! Symbols, segments, and symbol resolution.
//!
//! A symbol's value is a full expression, so equates can chain through other
//! symbols and labels can reference frags whose addresses are only known
//! after relaxation. Resolution walks the expression graph to a fixed point
//! with a three-color marking scheme; a gray symbol reached again is a
//! definition loop and gets diagnosed instead of recursing forever.

use crate::context::Assembler;
use crate::expr::{Expr, ExprValue, UnaryOp};
use crate::frag::FragId;
use crate::fx::{FxHashMap, FxHashSet};
use crate::intern::{Interner, NameId};
use crate::section::SectionId;
use crate::source::SourceLoc;
use bitflags::bitflags;
use ferrite_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);
entity_impl!(SymbolId, "sym");

/// Which segment a symbol (or expression result) lives in.
///
/// The variant *is* the segment: registers and internal expression symbols
/// are not distinguishable by a separate opcode field anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Plain numbers; also the home of equated constants.
    Absolute,
    /// Referenced but not yet defined.
    Undefined,
    /// Declared with a size, placed by the linker.
    Common,
    /// A machine register.
    Register,
    /// Internal symbols holding unreduced expressions.
    Expression,
    /// Debugging symbols with no address.
    Debug,
    /// An ordinary named section.
    Section(SectionId),
}

impl Segment {
    /// True for ordinary content-bearing sections, the segments an address
    /// can actually point into.
    pub fn is_normal(self) -> bool {
        matches!(self, Segment::Section(_))
    }
}

bitflags! {
    /// Symbol attribute and lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u32 {
        /// Visible outside this object (`.globl`).
        const EXTERNAL = 0x0001;
        /// Weak binding (`.weak`).
        const WEAK = 0x0002;
        /// Stands in for a section in relocations.
        const SECTION_SYMBOL = 0x0004;
        /// Named by an emitted relocation; survives stripping.
        const USED_IN_RELOC = 0x0008;
        /// Already written to the output symbol table.
        const WRITTEN = 0x0010;
        /// Final value computed.
        const RESOLVED = 0x0020;
        /// Resolution in progress (the gray color).
        const RESOLVING = 0x0040;
        /// Member of an MRI common block.
        const MRI_COMMON = 0x0080;
        /// Defined by `.set`/`=` and therefore re-assignable.
        const EQUATED = 0x0100;
        /// Referenced somewhere.
        const USED = 0x0200;
        /// Synthetic expression symbol.
        const FAKE = 0x0400;
        /// Local label (`4:`-style or `.L`-prefixed).
        const LOCAL_LABEL = 0x0800;
    }
}

/// A symbol table entry.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Interned canonical name.
    pub name: NameId,
    /// Home segment.
    pub segment: Segment,
    /// Tagged value.
    pub value: Expr,
    /// Owning frag for labels.
    pub frag: Option<FragId>,
    /// Attribute and lifecycle flags.
    pub flags: SymbolFlags,
    /// Object-format storage class.
    pub sclass: u8,
    /// Object-format type.
    pub ty: u16,
    /// Number of auxiliary records.
    pub numaux: u8,
    /// Size, for commons and `.lcomm`.
    pub size: u64,
    /// Requested alignment (power of two), for commons.
    pub align: u32,
    /// Where the symbol was defined (or first referenced).
    pub loc: SourceLoc,
    /// Final value, valid once `RESOLVED`.
    pub final_value: i64,
    /// Index in the written symbol table, once emitted.
    pub written_index: Option<u32>,
}

impl Symbol {
    fn new(name: NameId, segment: Segment, value: Expr, frag: Option<FragId>, loc: SourceLoc) -> Self {
        Self {
            name,
            segment,
            value,
            frag,
            flags: SymbolFlags::empty(),
            sclass: 0,
            ty: 0,
            numaux: 0,
            size: 0,
            align: 0,
            loc,
            final_value: 0,
            written_index: None,
        }
    }

    /// Is the symbol defined somewhere (not undefined, not common)?
    pub fn is_defined(&self) -> bool {
        !matches!(self.segment, Segment::Undefined | Segment::Common)
    }

    /// Externally visible?
    pub fn is_external(&self) -> bool {
        self.flags.contains(SymbolFlags::EXTERNAL)
    }
}

/// The symbol table plus the local-label bookkeeping.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// All symbols, fake ones included.
    pub syms: PrimaryMap<SymbolId, Symbol>,
    by_name: FxHashMap<NameId, SymbolId>,
    /// Source positions of synthetic expression symbols, for late
    /// diagnostics.
    pub expr_symbol_where: FxHashMap<SymbolId, SourceLoc>,
    fb_instances: FxHashMap<u32, u32>,
    dollar_instances: FxHashMap<u32, u32>,
    dollar_defined: FxHashSet<u32>,
    fake_name: Option<NameId>,
}

/// The shared name every synthetic expression symbol carries. The \x01
/// keeps it from colliding with anything a user could write.
const FAKE_LABEL_NAME: &str = "L0\u{1}";

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a symbol by interned name.
    pub fn lookup(&self, name: NameId) -> Option<SymbolId> {
        self.by_name.get(&name).copied()
    }

    /// Enter a symbol in the name index.
    pub fn insert(&mut self, name: NameId, sym: SymbolId) {
        self.by_name.insert(name, sym);
    }

    /// Create a symbol without entering it in the name index. Expression
    /// symbols and the anonymous `.` snapshots go through here.
    pub fn make_fake(
        &mut self,
        names: &mut Interner,
        segment: Segment,
        value: Expr,
        frag: Option<FragId>,
        loc: SourceLoc,
    ) -> SymbolId {
        let name = *self
            .fake_name
            .get_or_insert_with(|| names.intern(FAKE_LABEL_NAME));
        let mut sym = Symbol::new(name, segment, value, frag, loc);
        sym.flags.insert(SymbolFlags::FAKE);
        self.syms.push(sym)
    }

    /// Internal name of the numeric local label `n`, either the next
    /// instance (forward reference) or the current one (backward).
    pub fn fb_label_name(&self, n: u32, forward: bool) -> String {
        let instance = self.fb_instances.get(&n).copied().unwrap_or(0);
        let instance = if forward { instance + 1 } else { instance };
        format!("L{n}\u{2}{instance}")
    }

    /// Start a new instance of numeric label `n`; called when `n:` is
    /// defined.
    pub fn fb_label_increment(&mut self, n: u32) {
        *self.fb_instances.entry(n).or_insert(0) += 1;
    }

    /// Internal name of the dollar label `n$`.
    pub fn dollar_label_name(&self, n: u32, new_instance: bool) -> String {
        let instance = self.dollar_instances.get(&n).copied().unwrap_or(0);
        let instance = if new_instance { instance + 1 } else { instance };
        format!("L{n}\u{4}{instance}")
    }

    /// Is dollar label `n` currently defined?
    pub fn dollar_label_defined(&self, n: u32) -> bool {
        self.dollar_defined.contains(&n)
    }

    /// Define dollar label `n` (a fresh instance).
    pub fn dollar_label_define(&mut self, n: u32) {
        *self.dollar_instances.entry(n).or_insert(0) += 1;
        self.dollar_defined.insert(n);
    }

    /// Ordinary labels kill all dollar labels.
    pub fn dollar_labels_clear(&mut self) {
        self.dollar_defined.clear();
    }
}

impl Assembler {
    /// Find a symbol by name.
    pub fn symbol_find(&self, name: &str) -> Option<SymbolId> {
        let id = self.names.get(name)?;
        self.symbols.lookup(id)
    }

    /// Find or create an (undefined) symbol named `name`.
    pub fn symbol_find_or_make(&mut self, name: &str) -> SymbolId {
        let id = self.names.intern(name);
        if let Some(sym) = self.symbols.lookup(id) {
            return sym;
        }
        let loc = self.sources.here();
        let sym = self.symbols.syms.push(Symbol::new(
            id,
            Segment::Undefined,
            Expr::constant(0),
            None,
            loc,
        ));
        self.symbols.insert(id, sym);
        sym
    }

    /// The constant value of an absolute/register symbol, as known at parse
    /// time. Returns the raw additive constant for label symbols, which is
    /// their offset within their frag.
    pub fn symbol_constant_value(&self, sym: SymbolId) -> i64 {
        let s = &self.symbols.syms[sym];
        if s.flags.contains(SymbolFlags::RESOLVED) {
            return s.final_value;
        }
        s.value.add_number()
    }

    /// Define `name` as a label at the current position.
    ///
    /// Inside an open MRI common block the label binds as an offset from
    /// the block's symbol instead of the location counter.
    pub fn colon(&mut self, name: &str) -> SymbolId {
        let loc = self.sources.here();

        if let Some(common) = self.mri_common {
            let offset = self.symbols.syms[common].size as i64;
            let sym = self.symbol_find_or_make(name);
            let s = &mut self.symbols.syms[sym];
            s.segment = Segment::Common;
            s.value = Expr {
                value: ExprValue::Symbol {
                    sym: common,
                    add: offset,
                },
                unsigned: true,
            };
            s.flags.insert(SymbolFlags::MRI_COMMON);
            s.loc = loc;
            return sym;
        }

        let (value, frag) = if self.now_seg == Segment::Absolute {
            (Expr::constant(self.abs_offset), None)
        } else {
            (
                Expr::constant(self.frag_now_fix() as i64),
                Some(self.frag_now()),
            )
        };

        let sym = self.symbol_find_or_make(name);
        let defined = self.symbols.syms[sym].is_defined();
        if defined {
            let same = self.symbols.syms[sym].frag == frag
                && self.symbols.syms[sym].value == value
                && self.symbols.syms[sym].segment == self.now_seg;
            if !same {
                let prior = self.symbols.syms[sym].loc;
                let prior = self.sources.map.describe(prior);
                self.error(format!(
                    "symbol `{name}' is already defined (first defined at {prior})"
                ));
            }
            return sym;
        }

        let seg = self.now_seg;
        let s = &mut self.symbols.syms[sym];
        s.segment = seg;
        s.value = value;
        s.frag = frag;
        s.loc = loc;
        if name.starts_with(".L") || name.contains('\u{2}') {
            s.flags.insert(SymbolFlags::LOCAL_LABEL);
        } else {
            self.symbols.dollar_labels_clear();
        }
        sym
    }

    /// Bind `name` to an expression (`.set` / `=`). Labels cannot be
    /// re-bound; equated symbols can.
    pub fn equate(&mut self, name: &str, seg: Segment, value: Expr) -> SymbolId {
        let sym = self.symbol_find_or_make(name);
        let s = &self.symbols.syms[sym];
        if s.is_defined() && !s.flags.contains(SymbolFlags::EQUATED) {
            self.error(format!("symbol `{name}' is already defined"));
            return sym;
        }
        let loc = self.sources.here();
        let s = &mut self.symbols.syms[sym];
        s.segment = match value.value {
            ExprValue::Constant(_) => Segment::Absolute,
            ExprValue::Register(_) => Segment::Register,
            _ => {
                if seg == Segment::Undefined {
                    Segment::Expression
                } else {
                    seg
                }
            }
        };
        s.value = value;
        s.frag = None;
        s.loc = loc;
        s.flags.insert(SymbolFlags::EQUATED);
        s.flags.remove(SymbolFlags::RESOLVED);
        sym
    }

    /// The symbol standing in for `section` in relocations.
    pub fn section_symbol(&mut self, section: SectionId) -> SymbolId {
        if let Some(sym) = self.sections[section].section_symbol {
            return sym;
        }
        let name = self.names.resolve(self.sections[section].name).to_string();
        let sym = self.symbol_find_or_make(&name);
        let frag = self.sections[section].frag_root;
        let s = &mut self.symbols.syms[sym];
        s.segment = Segment::Section(section);
        s.value = Expr::constant(0);
        s.frag = frag;
        s.flags.insert(SymbolFlags::SECTION_SYMBOL);
        self.sections[section].section_symbol = Some(sym);
        sym
    }

    /// Compute (and cache) the final value of `sym`. Safe to call on an
    /// already-resolved symbol: that is a no-op returning the cached value.
    pub fn resolve_symbol(&mut self, sym: SymbolId) -> i64 {
        let flags = self.symbols.syms[sym].flags;
        if flags.contains(SymbolFlags::RESOLVED) {
            return self.symbols.syms[sym].final_value;
        }
        if flags.contains(SymbolFlags::RESOLVING) {
            let name = self.names.resolve(self.symbols.syms[sym].name).to_string();
            let loc = self.symbols.syms[sym].loc;
            self.diag
                .error(loc, format!("symbol {name} depends on itself"));
            let s = &mut self.symbols.syms[sym];
            s.flags.remove(SymbolFlags::RESOLVING);
            s.flags.insert(SymbolFlags::RESOLVED);
            return s.final_value;
        }
        self.symbols.syms[sym].flags.insert(SymbolFlags::RESOLVING);

        let value = self.symbols.syms[sym].value.clone();
        let base = self.frag_base(sym);

        let final_value = match value.value {
            ExprValue::Constant(v) => v + base,
            ExprValue::Absent | ExprValue::Illegal | ExprValue::Big(_) => base,
            ExprValue::Register(r) => r as i64,
            ExprValue::Symbol { sym: inner, add }
            | ExprValue::SymbolRva { sym: inner, add } => {
                let v = self.resolve_symbol(inner) + add;
                let inner_seg = self.symbols.syms[inner].segment;
                let my_seg = self.symbols.syms[sym].segment;
                if matches!(my_seg, Segment::Expression | Segment::Undefined)
                    && inner_seg != Segment::Undefined
                {
                    self.symbols.syms[sym].segment = inner_seg;
                }
                v
            }
            ExprValue::Unary { op, sym: inner, add } => {
                let v = self.resolve_symbol(inner);
                let v = match op {
                    UnaryOp::Minus => v.wrapping_neg(),
                    UnaryOp::BitNot => !v,
                    UnaryOp::LogicalNot => (v == 0) as i64,
                };
                if self.symbols.syms[inner].segment == Segment::Absolute {
                    self.symbols.syms[sym].segment = Segment::Absolute;
                }
                v + add
            }
            ExprValue::Binary { op, lhs, rhs, add } => {
                let lv = self.resolve_symbol(lhs);
                let rv = self.resolve_symbol(rhs);
                let lseg = self.symbols.syms[lhs].segment;
                let rseg = self.symbols.syms[rhs].segment;
                let v = self.fold_resolved(op, lv, rv, sym);
                let same_seg = lseg == rseg;
                if (op == crate::expr::BinaryOp::Sub && same_seg)
                    || (lseg == Segment::Absolute && rseg == Segment::Absolute)
                {
                    self.symbols.syms[sym].segment = Segment::Absolute;
                }
                v + add
            }
        };

        let s = &mut self.symbols.syms[sym];
        s.flags.remove(SymbolFlags::RESOLVING);
        s.flags.insert(SymbolFlags::RESOLVED);
        s.final_value = final_value;
        final_value
    }

    fn fold_resolved(
        &mut self,
        op: crate::expr::BinaryOp,
        l: i64,
        r: i64,
        at: SymbolId,
    ) -> i64 {
        use crate::expr::BinaryOp as B;
        let mut r = r;
        if r == 0 && matches!(op, B::Div | B::Mod) {
            let loc = self
                .symbols
                .expr_symbol_where
                .get(&at)
                .copied()
                .unwrap_or(self.symbols.syms[at].loc);
            self.diag.error(loc, "division by zero");
            r = 1;
        }
        let truth = |b: bool| if b { !0 } else { 0 };
        match op {
            B::Mul => l.wrapping_mul(r),
            B::Div => l.wrapping_div(r),
            B::Mod => l.wrapping_rem(r),
            B::Shl => l.wrapping_shl(r as u32),
            B::Shr => ((l as u64).wrapping_shr(r as u32)) as i64,
            B::BitOr => l | r,
            B::BitOrNot => l | !r,
            B::BitXor => l ^ r,
            B::BitAnd => l & r,
            B::Add => l.wrapping_add(r),
            B::Sub => l.wrapping_sub(r),
            B::Eq => truth(l == r),
            B::Ne => truth(l != r),
            B::Lt => truth(l < r),
            B::Le => truth(l <= r),
            B::Ge => truth(l >= r),
            B::Gt => truth(l > r),
            B::LogicalAnd => (l != 0 && r != 0) as i64,
            B::LogicalOr => (l != 0 || r != 0) as i64,
        }
    }

    /// The address contribution of a symbol's owning frag (plus its
    /// section's assigned address).
    fn frag_base(&self, sym: SymbolId) -> i64 {
        let s = &self.symbols.syms[sym];
        let mut base = 0i64;
        if let Some(frag) = s.frag {
            base += self.frags[frag].address as i64;
        }
        if let Segment::Section(sec) = s.segment {
            base += self.sections[sec].vma as i64;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;

    #[test]
    fn colon_defines_once() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let a = asm.colon("a");
        assert!(asm.symbols.syms[a].is_defined());
        asm.frag_more(2);
        asm.colon("a");
        assert_eq!(asm.diag.error_count(), 1);
    }

    #[test]
    fn equate_rebinds_equates_only() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        asm.equate("x", Segment::Absolute, Expr::constant(1));
        asm.equate("x", Segment::Absolute, Expr::constant(2));
        assert_eq!(asm.diag.error_count(), 0);
        let x = asm.symbol_find("x").unwrap();
        assert_eq!(asm.symbol_constant_value(x), 2);

        asm.colon("lab");
        asm.equate("lab", Segment::Absolute, Expr::constant(3));
        assert_eq!(asm.diag.error_count(), 1);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut asm = Assembler::new(AsmOptions::default());
        let a = asm.colon("a");
        asm.frags[asm.symbols.syms[a].frag.unwrap()].address = 0x40;
        let v1 = asm.resolve_symbol(a);
        let v2 = asm.resolve_symbol(a);
        assert_eq!(v1, 0x40);
        assert_eq!(v1, v2);
    }

    #[test]
    fn resolve_chain() {
        let mut asm = Assembler::new(AsmOptions::default());
        let a = asm.equate("a", Segment::Absolute, Expr::constant(10));
        let b_val = Expr {
            value: ExprValue::Symbol { sym: a, add: 5 },
            unsigned: true,
        };
        let b = asm.equate("b", Segment::Expression, b_val);
        assert_eq!(asm.resolve_symbol(b), 15);
        assert_eq!(asm.symbols.syms[b].segment, Segment::Absolute);
    }

    #[test]
    fn cycle_reports_depends_on_itself() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let a = asm.symbol_find_or_make("a");
        let b = asm.symbol_find_or_make("b");
        asm.symbols.syms[a].value = Expr {
            value: ExprValue::Symbol { sym: b, add: 1 },
            unsigned: true,
        };
        asm.symbols.syms[a].segment = Segment::Expression;
        asm.symbols.syms[b].value = Expr {
            value: ExprValue::Symbol { sym: a, add: 1 },
            unsigned: true,
        };
        asm.symbols.syms[b].segment = Segment::Expression;
        asm.resolve_symbol(a);
        assert_eq!(asm.diag.error_count(), 1);
        let msgs: Vec<_> = asm.diag.reports().iter().map(|d| d.message.clone()).collect();
        assert!(msgs[0].contains("depends on itself"));
    }

    #[test]
    fn fb_label_instances() {
        let mut t = SymbolTable::new();
        assert_eq!(t.fb_label_name(4, true), "L4\u{2}1");
        t.fb_label_increment(4);
        assert_eq!(t.fb_label_name(4, false), "L4\u{2}1");
        assert_eq!(t.fb_label_name(4, true), "L4\u{2}2");
    }
}
