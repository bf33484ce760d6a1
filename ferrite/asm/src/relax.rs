//! Relaxation: choosing the final size of every variable frag.
//!
//! The driver makes an initial address guess for every frag in a section,
//! then iterates: each pass walks the chain in address order accumulating a
//! running `stretch`, letting aligns recompute their padding, orgs measure
//! the gap to their target, and machine-dependent frags walk their state
//! table. The loop ends when a whole pass changes nothing.
//!
//! Convergence: a machine frag's table walk starts from its current state
//! and only ever follows the grow links, so a state once reached is never
//! abandoned for a smaller one on a later pass. A would-be oscillation
//! therefore freezes at the larger encoding.

use crate::context::Assembler;
use crate::frag::{FragId, FragKind};
use crate::section::SectionId;
use crate::symbol::{Segment, SymbolId};
use crate::target::TargetOps;

/// One row of a generic relaxation table.
#[derive(Debug, Clone, Copy)]
pub struct RelaxEntry {
    /// Largest in-range forward reach of this encoding.
    pub forward: i64,
    /// Most negative in-range backward reach.
    pub backward: i64,
    /// Encoded length in bytes.
    pub length: u32,
    /// Next (larger) state to try; 0 terminates the chain.
    pub next: u32,
}

/// Bytes needed to advance `address` to the next boundary with the low
/// `power` bits clear.
pub fn relax_align(address: u64, power: u32) -> u64 {
    let mask = (1u64 << power) - 1;
    ((address + mask) & !mask) - address
}

/// Padding an align frag inserts at `address`, honoring the fill-unit size
/// and the maximum-skip limit stored in the frag subtype.
fn align_padding(address: u64, power: u32, unit: u64, max_skip: u32) -> u64 {
    let mut pad = relax_align(address, power);
    if unit > 1 && pad % unit != 0 {
        pad -= pad % unit;
    }
    if max_skip != 0 && pad > max_skip as u64 {
        pad = 0;
    }
    pad
}

/// A symbol's address as seen mid-relaxation: its constant plus the current
/// address of its owning frag.
fn relax_symbol_address(asm: &Assembler, sym: SymbolId) -> i64 {
    let s = &asm.symbols.syms[sym];
    let mut v = s.value.add_number();
    if let Some(frag) = s.frag {
        v += asm.frags[frag].address as i64;
    }
    v
}

/// Is `needle` somewhere after `from` on the chain?
fn is_downrange(asm: &Assembler, from: FragId, needle: FragId) -> bool {
    let mut cur = asm.frags[from].next;
    while let Some(id) = cur {
        if id == needle {
            return true;
        }
        cur = asm.frags[id].next;
    }
    false
}

fn chain(asm: &Assembler, section: SectionId) -> Vec<FragId> {
    let mut out = Vec::new();
    let mut cur = asm.sections[section].frag_root;
    while let Some(id) = cur {
        out.push(id);
        cur = asm.frags[id].next;
    }
    out
}

/// Relax one section's frag chain to a fixed point.
pub fn relax_segment(asm: &mut Assembler, target: &dyn TargetOps, section: SectionId) {
    let frags = chain(asm, section);

    // First guess of every address.
    let mut address: u64 = 0;
    for &id in &frags {
        asm.frags[id].address = address;
        address += asm.frags[id].fix as u64;

        match asm.frags[id].kind {
            FragKind::Fill => {
                let f = &asm.frags[id];
                address += f.var * f.offset.max(0) as u64;
            }
            FragKind::Align | FragKind::AlignCode => {
                let f = &asm.frags[id];
                let power = f.offset.max(0) as u32;
                let unit = f.var.max(1);
                let raw = relax_align(address, power);
                if unit > 1 && raw % unit != 0 {
                    let loc = f.loc;
                    asm.diag.error(
                        loc,
                        format!("alignment padding ({raw} bytes) not a multiple of {unit}"),
                    );
                }
                let max_skip = asm.frags[id].subtype;
                address += align_padding(address, power, unit, max_skip);
            }
            FragKind::Org | FragKind::Space | FragKind::BrokenWord => {
                // Assumed nugatory; the first relax pass measures them.
            }
            FragKind::MachineDependent => {
                let est = target.estimate_size_before_relax(asm, id, section);
                asm.frags[id].relax_size = est;
                address += est;
            }
        }
    }

    // Iterate until no frag changes size.
    loop {
        let mut stretch: i64 = 0;
        let mut stretched = false;

        for &id in &frags {
            let was_address = asm.frags[id].address;
            let address = (was_address as i64 + stretch) as u64;
            asm.frags[id].address = address;
            let fix = asm.frags[id].fix as u64;
            let offset = asm.frags[id].offset;
            let symbol = asm.frags[id].symbol;

            let growth: i64 = match asm.frags[id].kind {
                FragKind::Fill | FragKind::BrokenWord => 0,

                FragKind::Align | FragKind::AlignCode => {
                    let power = offset.max(0) as u32;
                    let unit = asm.frags[id].var.max(1);
                    let max_skip = asm.frags[id].subtype;
                    align_padding(address + fix, power, unit, max_skip) as i64
                        - align_padding(was_address + fix, power, unit, max_skip) as i64
                }

                FragKind::Org => {
                    let mut goal = offset;
                    if let Some(sym) = symbol {
                        goal += relax_symbol_address(asm, sym);
                    }
                    let after = asm.frags[id]
                        .next
                        .map(|n| asm.frags[n].address as i64)
                        .unwrap_or(address as i64 + fix as i64);
                    let mut growth = goal - after;
                    if growth < 0 {
                        let loc = asm.frags[id].loc;
                        asm.diag.error(loc, "attempt to .org backwards ignored");
                        growth = 0;
                    }
                    growth - stretch
                }

                FragKind::Space => {
                    let mut growth = 0;
                    if let Some(sym) = symbol {
                        let s = &asm.symbols.syms[sym];
                        if s.frag.is_some() || s.segment != Segment::Absolute {
                            let loc = asm.frags[id].loc;
                            asm.diag.error(loc, ".space specifies non-absolute value");
                        }
                        growth = relax_symbol_address(asm, sym);
                        asm.frags[id].symbol = None;
                        if growth < 0 {
                            let loc = asm.frags[id].loc;
                            asm.diag
                                .warn(loc, ".space or .fill with negative value, ignored");
                            growth = 0;
                        }
                    }
                    growth
                }

                FragKind::MachineDependent => {
                    if let Some(g) = target.relax_frag(asm, id, stretch) {
                        g
                    } else {
                        let table = target.relax_table();
                        let start_state = asm.frags[id].subtype as usize;
                        let mut this_state = start_state;

                        let mut goal = offset;
                        if let Some(sym) = symbol {
                            goal += relax_symbol_address(asm, sym);
                            // A frag not yet visited this pass will move by
                            // `stretch` too, unless something between grows;
                            // that forces another pass anyway.
                            let sym_frag = asm.symbols.syms[sym].frag;
                            if let Some(sf) = sym_frag {
                                if asm.frags[sf].address >= was_address
                                    && is_downrange(asm, id, sf)
                                {
                                    goal += stretch;
                                }
                            }
                        }

                        let aim = goal - address as i64 - fix as i64;
                        let mut next_state = table[this_state].next as usize;
                        if aim < 0 {
                            while next_state != 0 {
                                if aim >= table[this_state].backward {
                                    next_state = 0;
                                } else {
                                    this_state = next_state;
                                    next_state = table[this_state].next as usize;
                                }
                            }
                        } else {
                            while next_state != 0 {
                                if aim <= table[this_state].forward {
                                    next_state = 0;
                                } else {
                                    this_state = next_state;
                                    next_state = table[this_state].next as usize;
                                }
                            }
                        }

                        let growth = table[this_state].length as i64
                            - table[start_state].length as i64;
                        if growth != 0 {
                            log::debug!(
                                "relaxing {} at {address:#x}: state {start_state} -> {this_state}",
                                id
                            );
                            asm.frags[id].subtype = this_state as u32;
                            asm.frags[id].relax_size = table[this_state].length as u64;
                        }
                        growth
                    }
                }
            };

            if growth != 0 {
                stretch += growth;
                stretched = true;
            }
        }

        if !stretched {
            break;
        }
    }
}

/// Collapse every relaxed frag into an equivalent fill. Machine frags go
/// through the target's converter and then wane.
pub fn convert_frags(asm: &mut Assembler, target: &dyn TargetOps, section: SectionId) {
    let frags = chain(asm, section);
    for &id in &frags {
        match asm.frags[id].kind {
            FragKind::Fill => {}

            FragKind::Align | FragKind::AlignCode | FragKind::Org | FragKind::Space => {
                let next_addr = match asm.frags[id].next {
                    Some(n) => asm.frags[n].address,
                    None => continue,
                };
                let f = &asm.frags[id];
                let var = f.var.max(1);
                let span = next_addr as i64 - f.address as i64 - f.fix as i64;
                let repeat = span / var as i64;
                if repeat < 0 {
                    let loc = f.loc;
                    asm.diag
                        .error(loc, format!("attempt to .org/.space backwards? ({span})"));
                }
                let f = &mut asm.frags[id];
                if f.var == 0 {
                    // No pattern recorded; pad with zeros.
                    f.literal.push(0);
                    f.var = 1;
                }
                f.offset = repeat.max(0);
                f.kind = FragKind::Fill;
            }

            FragKind::MachineDependent => {
                target.convert_frag(asm, section, id);
                if let Some(n) = asm.frags[id].next {
                    debug_assert_eq!(
                        asm.frags[n].address - asm.frags[id].address,
                        asm.frags[id].fix as u64,
                        "converted frag size disagrees with relaxed address"
                    );
                }
                asm.frag_wane(id);
            }

            FragKind::BrokenWord => {
                asm.frag_wane(id);
            }
        }
    }
}

/// Check the frag-chain closure invariant: every frag's address plus its
/// final size equals the next frag's address. Returns the first violation.
pub fn check_chain_closure(asm: &Assembler, section: SectionId) -> Option<(FragId, u64, u64)> {
    let mut cur = asm.sections[section].frag_root;
    while let Some(id) = cur {
        let f = &asm.frags[id];
        if let Some(n) = f.next {
            let want = asm.frags[n].address;
            let got = f.address + f.size();
            if want != got {
                return Some((id, got, want));
            }
        }
        cur = f.next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::expr::Expr;
    use crate::target::null_target;

    #[test]
    fn relax_align_math() {
        assert_eq!(relax_align(0, 2), 0);
        assert_eq!(relax_align(1, 2), 3);
        assert_eq!(relax_align(4, 2), 0);
        assert_eq!(relax_align(5, 3), 3);
    }

    #[test]
    fn align_frag_pads() {
        let mut asm = Assembler::new(AsmOptions::default());
        let t = null_target();
        asm.frag_append(&[0xAA; 3]);
        asm.frag_align(2, 0x90, 0);
        asm.frag_append(&[0xBB; 1]);

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        relax_segment(&mut asm, &*t, text);
        convert_frags(&mut asm, &*t, text);

        // 3 bytes, 1 pad byte, then the 0xBB byte at offset 4.
        assert!(check_chain_closure(&asm, text).is_none());
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
        assert_eq!(bytes, vec![0xAA, 0xAA, 0xAA, 0x90, 0xBB]);
    }

    #[test]
    fn org_forward() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        asm.frag_append(&[1, 2]);
        asm.frag_var(crate::frag::FragKind::Org, 0, &[0xFF], 0, None, 8);
        asm.frag_append(&[3]);

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        relax_segment(&mut asm, &*t, text);
        convert_frags(&mut asm, &*t, text);
        assert!(check_chain_closure(&asm, text).is_none());

        // The org frag fills from offset 2 to offset 8.
        let root = asm.sections[text].frag_root.unwrap();
        let org_id = asm.frags[root].next.unwrap();
        let org = &asm.frags[org_id];
        assert_eq!(org.kind, FragKind::Fill);
        assert_eq!(org.fix, 2);
        assert_eq!(org.offset, 6);
        assert_eq!(asm.diag.error_count(), 0);
    }

    #[test]
    fn org_backwards_rejected() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        asm.frag_append(&[0; 8]);
        asm.frag_var(crate::frag::FragKind::Org, 0, &[0], 0, None, 4);

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        relax_segment(&mut asm, &*t, text);
        assert!(asm.diag.error_count() >= 1);
    }

    #[test]
    fn space_with_symbol() {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        asm.equate("n", crate::symbol::Segment::Absolute, Expr::constant(5));
        let n = asm.symbol_find("n").unwrap();
        asm.frag_var(crate::frag::FragKind::Space, 0, &[0], 0, Some(n), 0);
        asm.frag_append(&[7]);

        crate::frag::chain_subsegs(&mut asm);
        let text = asm.text;
        relax_segment(&mut asm, &*t, text);
        convert_frags(&mut asm, &*t, text);
        assert!(check_chain_closure(&asm, text).is_none());
        let root = asm.sections[text].frag_root.unwrap();
        let space_id = asm.frags[root].next.unwrap();
        assert_eq!(asm.frags[space_id].offset, 5);
    }
}
