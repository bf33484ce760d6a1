//! The link plan: output sections and their link-order lists.
//!
//! Each output section owns an ordered list of link orders. The default
//! plan groups input sections by name in first-seen order, assigns every
//! input section an offset in its output section, allocates commons at
//! the end of `.bss`, and (for final links) lays the sections out from
//! the image base. Drivers with a script-like layout of their own can
//! build a plan directly instead.

use crate::hash::{DefHome, LinkState};
use crate::input::{InputId, LinkContext};
use ferrite_asm::target::RelocKind;
use ferrite_coff::STYP_BSS;
use rustc_hash::FxHashMap;

/// One entry of an output section's link order.
#[derive(Debug, Clone)]
pub enum LinkOrder {
    /// Copy and relocate an input section.
    Indirect {
        /// The input file.
        input: InputId,
        /// Section index within the input.
        section: usize,
        /// Offset within the output section.
        offset: u64,
        /// Size being copied.
        size: u64,
    },
    /// Synthesize a relocation against a named symbol.
    SymbolReloc {
        /// Offset within the output section.
        offset: u64,
        /// Target symbol name.
        symbol: String,
        /// Relocation kind.
        kind: RelocKind,
        /// Addend written into the section bytes.
        addend: i64,
    },
    /// Synthesize a relocation against an output section.
    SectionReloc {
        /// Offset within the output section.
        offset: u64,
        /// Target output-section name.
        section: String,
        /// Relocation kind.
        kind: RelocKind,
        /// Addend written into the section bytes.
        addend: i64,
    },
    /// Raw bytes at an offset (format-default filler).
    Data {
        /// Offset within the output section.
        offset: u64,
        /// The bytes.
        bytes: Vec<u8>,
    },
}

/// One output section being built.
#[derive(Debug)]
pub struct OutputSection {
    /// Section name.
    pub name: String,
    /// Wire flags (`STYP_*`), merged from the inputs.
    pub styp: u32,
    /// Assigned address.
    pub vma: u64,
    /// Total size.
    pub size: u64,
    /// Ordered work list.
    pub orders: Vec<LinkOrder>,
}

/// The whole plan, plus the placement map the copy phase needs.
#[derive(Debug)]
pub struct LinkPlan {
    /// Output sections, in output order.
    pub sections: Vec<OutputSection>,
    /// `(input, input-section)` to `(output-section, output-offset)`.
    pub placement: FxHashMap<(InputId, usize), (usize, u64)>,
}

impl LinkPlan {
    /// Find an output section by name.
    pub fn section_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }
}

fn output_align(name: &str) -> u64 {
    if name.starts_with(".stab") {
        1
    } else {
        4
    }
}

/// Build the default name-grouped plan.
pub fn build_plan(ctx: &mut LinkContext) -> LinkPlan {
    let mut sections: Vec<OutputSection> = Vec::new();
    let mut by_name: FxHashMap<String, usize> = FxHashMap::default();
    let mut placement = FxHashMap::default();

    // Link-once sections (`.gnu.linkonce.*`) keep the first definition
    // of each name and discard the rest.
    let mut linkonce_seen: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();

    let inputs: Vec<InputId> = ctx.inputs.keys().collect();
    for &input in &inputs {
        let nsections = ctx.inputs[input].object.sections.len();
        for isec in 0..nsections {
            if ctx.inputs[input].excluded.contains(&isec) {
                continue;
            }
            let header = &ctx.inputs[input].object.sections[isec].header;
            let name = header.name.clone();

            if name.starts_with(".gnu.linkonce.") {
                if !linkonce_seen.insert(name.clone()) {
                    ctx.inputs[input].excluded.insert(isec);
                    log::debug!("discarding duplicate link-once section `{name}'");
                    continue;
                }
            }
            let header = &ctx.inputs[input].object.sections[isec].header;
            let styp = header.flags;
            let size = header.size as u64;

            let out = match by_name.get(&name) {
                Some(&i) => i,
                None => {
                    let i = sections.len();
                    sections.push(OutputSection {
                        name: name.clone(),
                        styp,
                        vma: 0,
                        size: 0,
                        orders: Vec::new(),
                    });
                    by_name.insert(name, i);
                    i
                }
            };
            sections[out].styp |= styp;

            let align = output_align(&sections[out].name);
            let offset = (sections[out].size + align - 1) & !(align - 1);
            sections[out].orders.push(LinkOrder::Indirect {
                input,
                section: isec,
                offset,
                size,
            });
            sections[out].size = offset + size;
            placement.insert((input, isec), (out, offset));
        }
    }

    // Merged stab strings become their own output section.
    if !ctx.stab_strings.is_trivial() && !ctx.options.relocatable {
        let bytes = ctx.stab_strings.bytes().to_vec();
        let i = sections.len();
        sections.push(OutputSection {
            name: ".stabstr".into(),
            styp: ferrite_coff::STYP_INFO,
            vma: 0,
            size: bytes.len() as u64,
            orders: vec![LinkOrder::Data { offset: 0, bytes }],
        });
        by_name.insert(".stabstr".into(), i);
    }

    // Allocate commons at the end of .bss (final links only; relocatable
    // output keeps them common).
    if !ctx.options.relocatable {
        let have_commons = ctx
            .hash
            .entries
            .iter()
            .any(|e| matches!(e.state, LinkState::Common { .. }));
        if have_commons {
            let bss = match by_name.get(".bss") {
                Some(&i) => i,
                None => {
                    let i = sections.len();
                    sections.push(OutputSection {
                        name: ".bss".into(),
                        styp: STYP_BSS,
                        vma: 0,
                        size: 0,
                        orders: Vec::new(),
                    });
                    by_name.insert(".bss".into(), i);
                    i
                }
            };
            for entry in ctx.hash.entries.iter_mut() {
                if let LinkState::Common { size, align } = entry.state {
                    let unit = 1u64 << align;
                    let offset = (sections[bss].size + unit - 1) & !(unit - 1);
                    sections[bss].size = offset + size;
                    entry.state = LinkState::Defined {
                        home: DefHome::Output {
                            section: bss,
                            offset,
                        },
                        value: 0,
                        weak: false,
                    };
                }
            }
        }
    }

    // Address assignment.
    if !ctx.options.relocatable {
        let mut vma = ctx.options.image_base;
        for s in sections.iter_mut() {
            vma = (vma + 15) & !15;
            s.vma = vma;
            vma += s.size;
        }
    }

    LinkPlan {
        sections,
        placement,
    }
}
