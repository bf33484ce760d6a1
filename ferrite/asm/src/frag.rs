//! Frags: the unit of pending output and of relaxation.
//!
//! A frag is a known number of bytes followed by a variable-size tail whose
//! final length is not known until relaxation. The fixed bytes and the
//! variable fill pattern share one buffer: `literal[..fix]` is committed,
//! `literal[fix..]` is the pattern (or reserved space for a
//! machine-dependent tail). Frags are chained per subsegment while parsing;
//! the chains concatenate into one per-section chain before relaxation.

use crate::context::Assembler;
use crate::fixup::FixupId;
use crate::section::SectionId;
use crate::source::SourceLoc;
use crate::symbol::SymbolId;
use ferrite_entity::entity_impl;

/// An opaque reference to a frag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragId(u32);
entity_impl!(FragId, "frag");

/// An opaque reference to a subsegment chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubsegId(u32);
entity_impl!(SubsegId, "subseg");

/// What state a frag's tail is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragKind {
    /// Variable bytes repeated `offset` times; `offset == 0` makes a
    /// constant-length frag. The terminal form of every closed frag.
    Fill,
    /// Advance to the next address with the low `offset` bits clear,
    /// filling with the pattern.
    Align,
    /// Like `Align`, but the fill must be executable padding.
    AlignCode,
    /// Advance to `symbol + offset`; one variable fill byte.
    Org,
    /// Reserve `symbol`-many bytes (resolved at relax time); one variable
    /// fill byte.
    Space,
    /// Machine-dependent relaxable tail; the target decides the size.
    MachineDependent,
    /// Long/short jump table workaround for targets without a working
    /// span-dependent `.word`.
    BrokenWord,
}

/// A code fragment.
#[derive(Debug)]
pub struct Frag {
    /// Address relative to the section start; valid after relaxation.
    pub address: u64,
    /// Next frag in the chain, in ascending address order.
    pub next: Option<FragId>,
    /// Committed bytes followed by the variable pattern.
    pub literal: Vec<u8>,
    /// Number of committed bytes (`literal[..fix]`).
    pub fix: usize,
    /// Size of one variable unit (the pattern is `literal[fix..fix+var]`).
    pub var: u64,
    /// Repeat count, alignment power, or target offset, per `kind`.
    pub offset: i64,
    /// Tail state.
    pub kind: FragKind,
    /// Machine-dependent relaxation state.
    pub subtype: u32,
    /// Current estimated size of a machine-dependent tail.
    pub relax_size: u64,
    /// Symbol operand for org/space/machine frags.
    pub symbol: Option<SymbolId>,
    /// Where the frag was created or became variable.
    pub loc: SourceLoc,
}

impl Frag {
    /// A fresh zero-length fill frag.
    pub fn empty(kind: FragKind, loc: SourceLoc) -> Self {
        Self {
            address: 0,
            next: None,
            literal: Vec::new(),
            fix: 0,
            var: 0,
            offset: 0,
            kind,
            subtype: 0,
            relax_size: 0,
            symbol: None,
            loc,
        }
    }

    /// The frag's current size contribution, as known during relaxation.
    pub fn size(&self) -> u64 {
        match self.kind {
            FragKind::Fill => self.fix as u64 + self.var * self.offset.max(0) as u64,
            FragKind::MachineDependent => self.fix as u64 + self.relax_size,
            // Align/org/space contributions are recomputed from addresses
            // every pass; between passes only the fixed part counts.
            _ => self.fix as u64,
        }
    }
}

/// One numbered strand within a section.
#[derive(Debug)]
pub struct Subseg {
    /// Owning section.
    pub section: SectionId,
    /// Sort key; strands concatenate in ascending subseg order.
    pub subseg: u32,
    /// First frag of the strand.
    pub frag_root: FragId,
    /// Open frag of the strand.
    pub frag_last: FragId,
    /// Fixups created while this strand was open.
    pub fixups: Vec<FixupId>,
}

impl Assembler {
    /// Close the open frag and start a new one with `capacity` reserved.
    pub fn frag_new(&mut self, capacity: usize) -> FragId {
        let subseg = match self.now_subseg {
            Some(s) => s,
            None => panic!("frag_new outside any section"),
        };
        let loc = self.sources.here();
        let mut frag = Frag::empty(FragKind::Fill, loc);
        frag.literal.reserve(capacity);
        let id = self.frags.push(frag);
        let prev = self.subsegs[subseg].frag_last;
        self.frags[prev].next = Some(id);
        self.subsegs[subseg].frag_last = id;
        id
    }

    /// Reserve `n` more bytes in the open frag's fixed portion and return
    /// the frag and the offset where they start. The bytes are
    /// zero-initialized; callers overwrite them in place.
    pub fn frag_more(&mut self, n: usize) -> (FragId, usize) {
        let frag = self.frag_now();
        let f = &mut self.frags[frag];
        debug_assert_eq!(f.kind, FragKind::Fill);
        let at = f.fix;
        f.literal.resize(at + n, 0);
        f.fix += n;
        (frag, at)
    }

    /// Append `bytes` to the open frag.
    pub fn frag_append(&mut self, bytes: &[u8]) -> (FragId, usize) {
        let frag = self.frag_now();
        let f = &mut self.frags[frag];
        let at = f.fix;
        f.literal.extend_from_slice(bytes);
        f.fix += bytes.len();
        (frag, at)
    }

    /// Close the open frag with a variable tail and open a fresh one.
    ///
    /// `max` bounds how much the tail can grow; `pattern` is the variable
    /// unit (fill byte(s), or empty for machine-dependent tails that the
    /// target materializes later). Returns the closed frag.
    #[allow(clippy::too_many_arguments)]
    pub fn frag_var(
        &mut self,
        kind: FragKind,
        max: usize,
        pattern: &[u8],
        subtype: u32,
        symbol: Option<SymbolId>,
        offset: i64,
    ) -> FragId {
        let frag = self.frag_now();
        {
            let f = &mut self.frags[frag];
            f.kind = kind;
            f.subtype = subtype;
            f.symbol = symbol;
            f.offset = offset;
            f.var = pattern.len() as u64;
            f.literal.extend_from_slice(pattern);
            f.literal.reserve(max.saturating_sub(pattern.len()));
            f.loc = self.sources.here();
        }
        self.frag_new(0);
        frag
    }

    /// Insert an alignment frag: advance to a multiple of `1 << power`,
    /// filling with `fill`. `max` of zero means no limit on the skip.
    pub fn frag_align(&mut self, power: u32, fill: u8, max: usize) {
        self.frag_align_pattern(power, &[fill], max);
    }

    /// Alignment with a multi-byte fill pattern.
    pub fn frag_align_pattern(&mut self, power: u32, pattern: &[u8], max: usize) {
        let frag = self.frag_var(FragKind::Align, max, pattern, 0, None, power as i64);
        // Remember the skip limit in the subtype; zero means unlimited.
        self.frags[frag].subtype = max as u32;
    }

    /// Alignment that must be filled with executable padding.
    pub fn frag_align_code(&mut self, power: u32, max: usize) {
        let frag = self.frag_var(FragKind::AlignCode, max, &[0], 0, None, power as i64);
        self.frags[frag].subtype = max as u32;
    }

    /// Turn a frag into a zero-length fill, keeping its committed bytes.
    pub fn frag_wane(&mut self, frag: FragId) {
        let f = &mut self.frags[frag];
        f.kind = FragKind::Fill;
        f.literal.truncate(f.fix);
        f.var = 0;
        f.offset = 0;
        f.relax_size = 0;
        f.symbol = None;
    }
}

/// Concatenate every section's subsegment chains, in subseg order, into a
/// single frag chain rooted at the section. Fixup lists migrate from the
/// subsegments to the section at the same time. Each section's chain is
/// terminated by a fresh empty fill frag so relaxation always has a
/// well-defined `next` address to compare against.
pub fn chain_subsegs(asm: &mut Assembler) {
    let sections: Vec<SectionId> = asm.sections.keys().collect();
    for section in sections {
        let subsegs = asm.sections[section].subsegs.clone();
        let mut root: Option<FragId> = None;
        let mut last: Option<FragId> = None;
        let mut fixups: Vec<FixupId> = Vec::new();

        for subseg in subsegs {
            let chain_root = asm.subsegs[subseg].frag_root;
            let chain_last = asm.subsegs[subseg].frag_last;
            match last {
                None => root = Some(chain_root),
                Some(prev) => asm.frags[prev].next = Some(chain_root),
            }
            last = Some(chain_last);
            fixups.append(&mut asm.subsegs[subseg].fixups);
        }

        // Terminal fill frag with fix == 0, offset == 0.
        if let Some(prev) = last {
            let loc = asm.frags[prev].loc;
            let terminal = asm.frags.push(Frag::empty(FragKind::Fill, loc));
            asm.frags[prev].next = Some(terminal);
            last = Some(terminal);
        }

        let sec = &mut asm.sections[section];
        sec.frag_root = root;
        sec.frag_last = last;
        sec.fixups = fixups;
    }
    asm.frags_chained = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;

    #[test]
    fn frag_more_appends() {
        let mut asm = Assembler::new(AsmOptions::default());
        let (f1, at1) = asm.frag_more(4);
        assert_eq!(at1, 0);
        let (f2, at2) = asm.frag_more(2);
        assert_eq!(f1, f2);
        assert_eq!(at2, 4);
        assert_eq!(asm.frags[f1].fix, 6);
    }

    #[test]
    fn frag_var_closes() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.frag_append(&[1, 2]);
        let closed = asm.frag_var(FragKind::Space, 0, &[0], 0, None, 8);
        assert_eq!(asm.frags[closed].kind, FragKind::Space);
        assert_eq!(asm.frags[closed].fix, 2);
        assert_eq!(asm.frags[closed].var, 1);
        // A fresh frag is now open.
        let open = asm.frag_now();
        assert_ne!(open, closed);
        assert_eq!(asm.frags[open].fix, 0);
    }

    #[test]
    fn subseg_ordering() {
        let mut asm = Assembler::new(AsmOptions::default());
        let text = asm.text;
        asm.subseg_set(text, 2);
        asm.frag_append(b"BB");
        asm.subseg_set(text, 1);
        asm.frag_append(b"AA");
        asm.subseg_set(text, 2);
        asm.frag_append(b"CC");

        chain_subsegs(&mut asm);

        // Walk the chained frags and collect bytes: subseg 0, 1, then 2.
        let mut bytes = Vec::new();
        let mut cur = asm.sections[text].frag_root;
        while let Some(id) = cur {
            let f = &asm.frags[id];
            bytes.extend_from_slice(&f.literal[..f.fix]);
            cur = f.next;
        }
        assert_eq!(bytes, b"AABBCC");

        // Chain ends in a terminal empty fill.
        let last = asm.sections[text].frag_last.unwrap();
        let t = &asm.frags[last];
        assert_eq!(t.kind, FragKind::Fill);
        assert_eq!((t.fix, t.offset), (0, 0));
    }
}
