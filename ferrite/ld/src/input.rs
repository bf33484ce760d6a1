//! Input files and external-symbol loading.
//!
//! Each input object gets a `sym_hashes` array parallel to its raw symbol
//! slots; the slot of every external symbol points at its link-hash
//! entry, so relocation processing can go from a raw `r_symndx` to the
//! global resolution in one step.

use crate::hash::{DefHome, LinkState, LinkHash};
use crate::options::{LinkCallbacks, LinkOptions};
use crate::stabs::StabStringMerge;
use ferrite_coff::types::SymEntry;
use ferrite_coff::{CoffObject, C_EXT, C_WEAKEXT, N_ABS};
use ferrite_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashSet;

/// An opaque reference to an input file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(u32);
entity_impl!(InputId, "input");

/// PE-style options gathered from `.drectve` sections.
#[derive(Debug, Clone, Default)]
pub struct DirectiveInfo {
    /// `-heap reserve[,commit]`.
    pub heap: Option<(u64, Option<u64>)>,
    /// `-stack reserve[,commit]`.
    pub stack: Option<(u64, Option<u64>)>,
    /// `-attr section flags` requests, applied to section headers.
    pub attrs: Vec<(String, String)>,
}

/// One loaded input object.
#[derive(Debug)]
pub struct InputFile {
    /// The decoded object.
    pub object: CoffObject,
    /// Parallel to the raw symbol slots: link-hash index of each external
    /// symbol.
    pub sym_hashes: Vec<Option<usize>>,
    /// Already copied to the output.
    pub output_done: bool,
    /// Sections excluded from the output (`.drectve`, merged
    /// `.stabstr`).
    pub excluded: FxHashSet<usize>,
    /// Per-input `.stab` string remapping, when the optimization ran.
    pub stab_map: Option<crate::stabs::StabMap>,
}

/// All state of one link.
pub struct LinkContext {
    /// Configuration.
    pub options: LinkOptions,
    /// The global symbol table.
    pub hash: LinkHash,
    /// Loaded inputs, in link order.
    pub inputs: PrimaryMap<InputId, InputFile>,
    /// Merged `.stabstr` contents.
    pub stab_strings: StabStringMerge,
    /// Accumulated `.drectve` information.
    pub directives: DirectiveInfo,
}

impl LinkContext {
    /// Create a fresh link.
    pub fn new(options: LinkOptions) -> Self {
        Self {
            options,
            hash: LinkHash::new(),
            inputs: PrimaryMap::new(),
            stab_strings: StabStringMerge::new(),
            directives: DirectiveInfo::default(),
        }
    }

    /// Add one object file to the link, merging its externals into the
    /// hash.
    pub fn add_object(
        &mut self,
        callbacks: &mut dyn LinkCallbacks,
        object: CoffObject,
    ) -> InputId {
        let id = self.inputs.next_key();
        let mut sym_hashes = vec![None; object.symbols.len()];

        for (i, entry) in object.symbols.iter().enumerate() {
            let SymEntry::Sym(sym) = entry else { continue };
            if !sym.is_global_class() {
                continue;
            }

            let weak = sym.sclass == C_WEAKEXT;
            let new_state = if sym.scnum == 0 {
                if sym.value == 0 {
                    if weak {
                        LinkState::WeakUndefined
                    } else {
                        LinkState::Undefined
                    }
                } else {
                    LinkState::Common {
                        size: sym.value as u64,
                        align: common_alignment(sym.value as u64),
                    }
                }
            } else if sym.scnum == N_ABS {
                LinkState::Defined {
                    home: DefHome::Absolute,
                    value: sym.value as u64,
                    weak,
                }
            } else {
                let section = (sym.scnum - 1) as usize;
                let vaddr = object
                    .sections
                    .get(section)
                    .map(|s| s.header.vaddr as u64)
                    .unwrap_or(0);
                LinkState::Defined {
                    home: DefHome::Input { input: id, section },
                    value: (sym.value as u64).wrapping_sub(vaddr),
                    weak,
                }
            };

            let hidx = self.hash.entry(&sym.name);
            merge_states(&mut self.hash.entries[hidx], new_state, &object, callbacks);
            sym_hashes[i] = Some(hidx);

            // Capture class/type/aux the way the historic linker does: on
            // first sight, or whenever this input actually defines the
            // symbol.
            let e = &mut self.hash.entries[hidx];
            if (e.sclass == 0 && e.ty == 0)
                || sym.scnum != 0
                || (sym.value != 0 && !matches!(e.state, LinkState::Defined { .. }))
            {
                e.sclass = sym.sclass;
                e.ty = sym.ty;
                e.numaux = sym.numaux;
                if sym.numaux > 0 {
                    let mut aux = Vec::with_capacity(sym.numaux as usize);
                    for j in 1..=sym.numaux as usize {
                        if let Some(SymEntry::Aux(a)) = object.symbols.get(i + j) {
                            aux.push(a.clone());
                        }
                    }
                    e.aux = aux;
                    e.aux_from = Some(id);
                }
            }
        }

        let mut input = InputFile {
            object,
            sym_hashes,
            output_done: false,
            excluded: FxHashSet::default(),
            stab_map: None,
        };

        self.process_directives(&mut input);
        if !self.options.relocatable && !self.options.traditional_format {
            crate::stabs::merge_input_stabs(&mut self.stab_strings, &mut input);
        }

        self.inputs.push(input)
    }

    /// Parse `.drectve` embedded commands and drop the section from the
    /// output.
    fn process_directives(&mut self, input: &mut InputFile) {
        let Some(index) = input.object.section_by_name(".drectve") else {
            return;
        };
        input.excluded.insert(index);

        let text = String::from_utf8_lossy(&input.object.sections[index].data).into_owned();
        let mut words = text.split_whitespace().peekable();
        while let Some(word) = words.next() {
            match word {
                "-heap" => {
                    if let Some(v) = words.next().and_then(parse_pair) {
                        self.directives.heap = Some(v);
                    }
                }
                "-stack" => {
                    if let Some(v) = words.next().and_then(parse_pair) {
                        self.directives.stack = Some(v);
                    }
                }
                "-attr" => {
                    let section = words.next().unwrap_or("").to_string();
                    let flags = words.next().unwrap_or("").to_string();
                    if !section.is_empty() {
                        self.directives.attrs.push((section, flags));
                    }
                }
                other => {
                    log::debug!("ignoring .drectve token `{other}'");
                }
            }
        }
    }
}

/// Alignment for a common of `size` bytes: the largest power of two that
/// divides into it comfortably, capped at 16 bytes.
fn common_alignment(size: u64) -> u32 {
    let mut p = 0;
    while (1u64 << (p + 1)) <= size && p < 4 {
        p += 1;
    }
    p
}

fn parse_pair(word: &str) -> Option<(u64, Option<u64>)> {
    let mut it = word.split(',');
    let first = parse_num(it.next()?)?;
    let second = it.next().and_then(parse_num);
    Some((first, second))
}

fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Apply the historic COFF resolution rules for one symbol sighting.
fn merge_states(
    entry: &mut crate::hash::HashEntry,
    new: LinkState,
    object: &CoffObject,
    callbacks: &mut dyn LinkCallbacks,
) {
    use LinkState as S;
    let old = entry.state;
    entry.state = match (old, new) {
        (S::New, n) => n,

        // References never downgrade anything.
        (o, S::Undefined) | (o, S::WeakUndefined) if !matches!(o, S::New) => o,

        (S::Undefined, n) | (S::WeakUndefined, n) => n,

        // A strong definition wins over weak and common.
        (
            S::Defined {
                weak: true, ..
            },
            n @ S::Defined { weak: false, .. },
        ) => n,
        (o @ S::Defined { weak: false, .. }, S::Defined { weak: true, .. }) => o,

        (S::Defined { weak: false, .. }, S::Defined { weak: false, .. }) => {
            callbacks.multiple_definition(&entry.name, "a previous input", &object.name);
            old
        }
        (o @ S::Defined { weak: true, .. }, S::Defined { weak: true, .. }) => o,

        // Definitions beat commons; bigger commons beat smaller ones.
        (S::Common { .. }, n @ S::Defined { weak: false, .. }) => n,
        (o @ S::Common { .. }, S::Defined { weak: true, .. }) => o,
        (o @ S::Defined { .. }, S::Common { .. }) => o,
        (
            S::Common {
                size: s1,
                align: a1,
            },
            S::Common {
                size: s2,
                align: a2,
            },
        ) => S::Common {
            size: s1.max(s2),
            align: a1.max(a2),
        },

        (o, _) => o,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DefaultCallbacks;
    use ferrite_coff::types::Syment;

    fn object_with_symbol(name: &str, file: &str, scnum: i16, value: u32) -> CoffObject {
        let sym = Syment {
            name: name.into(),
            value,
            scnum,
            ty: 0,
            sclass: C_EXT,
            numaux: 0,
        };
        CoffObject {
            name: file.into(),
            endian: ferrite_asm::context::Endian::Little,
            header: Default::default(),
            sections: vec![],
            symbols: vec![SymEntry::Sym(sym)],
            strings: vec![],
        }
    }

    #[test]
    fn undefined_then_defined() {
        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = DefaultCallbacks {
            quiet: true,
            ..Default::default()
        };
        ctx.add_object(&mut cb, object_with_symbol("foo", "a.o", 0, 0));
        assert_eq!(ctx.hash.undefined_count(), 1);
        // scnum is 1-based, so this defines foo in a section the test
        // doesn't model further.
        ctx.add_object(&mut cb, object_with_symbol("foo", "b.o", 1, 8));
        assert_eq!(ctx.hash.undefined_count(), 0);
        let e = &ctx.hash.entries[ctx.hash.lookup("foo").unwrap()];
        assert!(matches!(e.state, LinkState::Defined { value: 8, .. }));
    }

    #[test]
    fn double_definition_reported() {
        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = DefaultCallbacks {
            quiet: true,
            ..Default::default()
        };
        ctx.add_object(&mut cb, object_with_symbol("foo", "a.o", 1, 0));
        ctx.add_object(&mut cb, object_with_symbol("foo", "b.o", 1, 4));
        assert_eq!(cb.error_count(), 1);
    }

    #[test]
    fn common_rules() {
        let mut ctx = LinkContext::new(LinkOptions::default());
        let mut cb = DefaultCallbacks {
            quiet: true,
            ..Default::default()
        };
        // Common merges keep the larger size.
        ctx.add_object(&mut cb, object_with_symbol("c", "a.o", 0, 8));
        ctx.add_object(&mut cb, object_with_symbol("c", "b.o", 0, 16));
        let e = &ctx.hash.entries[ctx.hash.lookup("c").unwrap()];
        assert!(matches!(e.state, LinkState::Common { size: 16, .. }));

        // A definition beats the common.
        ctx.add_object(&mut cb, object_with_symbol("c", "c.o", 1, 0));
        let e = &ctx.hash.entries[ctx.hash.lookup("c").unwrap()];
        assert!(matches!(e.state, LinkState::Defined { .. }));
        assert_eq!(cb.error_count(), 0);
    }
}
