//! The write phase: from relaxed frags to an object file.
//!
//! `build_object` runs the tail of the pipeline: concatenate subsegment
//! chains, relax and convert every section, resolve symbols, redirect
//! relocations onto section symbols where possible, apply fixups, and
//! collect the result into a format-neutral [`ObjModule`]. `write_object`
//! then drives an [`ObjectWriter`] implementation over the module; the
//! writer owns the on-disk layout and the assembler core never sees it.

use crate::context::{Assembler, Endian};
use crate::frag::chain_subsegs;
use crate::fx::FxHashMap;
use crate::section::{SectionFlags, SectionId};
use crate::symbol::{Segment, SymbolFlags, SymbolId};
use crate::target::{RelocKind, TargetOps};
use crate::{AsmError, AsmResult};
use thiserror::Error;

/// Failure while serializing an object file.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A computed size or count exceeds what the format can encode.
    #[error("object format limit exceeded: {0}")]
    TooLarge(String),

    /// The module asks for something the format cannot express.
    #[error("can't represent in output format: {0}")]
    Unrepresentable(String),
}

/// Write an integer into `buf` in the requested byte order. Buffers wider
/// than eight bytes are zero-filled beyond the value.
pub fn number_to_chars(buf: &mut [u8], val: u64, endian: Endian) {
    let n = buf.len();
    for i in 0..n {
        let byte = if i < 8 { (val >> (8 * i)) as u8 } else { 0 };
        match endian {
            Endian::Little => buf[i] = byte,
            Endian::Big => buf[n - 1 - i] = byte,
        }
    }
}

/// Where an output symbol lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjSymbolHome {
    /// Referenced but not defined here.
    Undefined,
    /// An absolute value.
    Absolute,
    /// Debugging symbol with no section.
    Debug,
    /// Defined in the section with this (0-based) module index.
    Section(usize),
    /// A common symbol: placed by the linker.
    Common,
}

/// A symbol ready for the object writer.
#[derive(Debug, Clone)]
pub struct ObjSymbol {
    /// Symbol name.
    pub name: String,
    /// Value (address, constant, or common size).
    pub value: i64,
    /// Home section.
    pub home: ObjSymbolHome,
    /// Externally visible.
    pub external: bool,
    /// Weak binding.
    pub weak: bool,
    /// Storage class, if the source set one; the writer picks a default
    /// otherwise.
    pub sclass: u8,
    /// Format-specific type.
    pub ty: u16,
    /// Declared alignment for commons (power of two).
    pub align: u32,
}

/// A relocation ready for the object writer.
#[derive(Debug, Clone)]
pub struct ObjReloc {
    /// Offset within the section.
    pub address: u64,
    /// Index into [`ObjModule::symbols`].
    pub symbol: usize,
    /// Relocation kind.
    pub kind: RelocKind,
    /// The value the patched bytes already carry.
    pub addend: i64,
    /// PC-relative relocation.
    pub pcrel: bool,
}

/// A section ready for the object writer.
#[derive(Debug, Clone)]
pub struct ObjSection {
    /// Section name.
    pub name: String,
    /// Attribute flags.
    pub flags: SectionFlags,
    /// Alignment, power of two.
    pub align: u32,
    /// Assigned address (zero in relocatable output).
    pub vma: u64,
    /// Size in bytes (bss sections have a size but no contents).
    pub size: u64,
    /// File-backed contents.
    pub contents: Vec<u8>,
    /// Relocations against this section.
    pub relocs: Vec<ObjReloc>,
}

/// Everything an object writer needs, independent of on-disk format.
#[derive(Debug)]
pub struct ObjModule {
    /// Byte order of the target.
    pub endian: Endian,
    /// Sections in output order.
    pub sections: Vec<ObjSection>,
    /// Symbols; locals first, then externals.
    pub symbols: Vec<ObjSymbol>,
    /// Position-independent output was requested.
    pub pic: bool,
    /// `-mrelocatable` style format flag.
    pub relocatable: bool,
}

/// The abstract interface between the assembler (or any other producer)
/// and an on-disk object format.
pub trait ObjectWriter {
    /// Begin the file: headers and layout computation.
    fn write_header(&mut self, module: &ObjModule) -> Result<(), WriteError>;
    /// Emit the contents of one section.
    fn write_contents(&mut self, module: &ObjModule, section: usize) -> Result<(), WriteError>;
    /// Emit the relocations of one section.
    fn write_relocs(&mut self, module: &ObjModule, section: usize) -> Result<(), WriteError>;
    /// Emit the symbol table.
    fn write_symbols(&mut self, module: &ObjModule) -> Result<(), WriteError>;
    /// Emit the string table and finish the file.
    fn finish(&mut self, module: &ObjModule) -> Result<(), WriteError>;
}

/// Redirect fixups against local, resolved symbols to their section
/// symbols, folding the symbol value into the addend. External and weak
/// symbols keep their own identity; everything named by a surviving fixup
/// is marked `used_in_reloc`.
fn adjust_reloc_syms(asm: &mut Assembler, section: SectionId) {
    let fixups = asm.sections[section].fixups.clone();
    for id in fixups {
        if asm.fixups[id].done {
            continue;
        }
        let Some(addsy) = asm.fixups[id].addsy else {
            continue;
        };

        let sym = &asm.symbols.syms[addsy];
        let keep = sym.is_external()
            || sym.flags.contains(SymbolFlags::WEAK)
            || !sym.segment.is_normal();
        if keep {
            asm.symbols.syms[addsy]
                .flags
                .insert(SymbolFlags::USED_IN_RELOC);
            continue;
        }

        let home = match sym.segment {
            Segment::Section(s) => s,
            _ => unreachable!("normal segment is a section"),
        };
        let value = asm.resolve_symbol(addsy);
        let section_sym = asm.section_symbol(home);
        asm.fixups[id].offset += value;
        asm.fixups[id].addsy = Some(section_sym);
        asm.symbols.syms[section_sym]
            .flags
            .insert(SymbolFlags::USED_IN_RELOC);
    }
}

fn section_contents(asm: &Assembler, section: SectionId) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cur = asm.sections[section].frag_root;
    while let Some(id) = cur {
        let f = &asm.frags[id];
        out.extend_from_slice(&f.literal[..f.fix]);
        if f.var > 0 {
            for _ in 0..f.offset.max(0) {
                out.extend_from_slice(&f.literal[f.fix..f.fix + f.var as usize]);
            }
        }
        cur = f.next;
    }
    out
}

/// Should this symbol appear in the output symbol table?
fn symbol_wanted(asm: &Assembler, id: SymbolId) -> bool {
    let sym = &asm.symbols.syms[id];
    if sym.flags.contains(SymbolFlags::FAKE) {
        return false;
    }
    if sym.segment == Segment::Register || sym.segment == Segment::Expression {
        return false;
    }
    if sym.flags.contains(SymbolFlags::USED_IN_RELOC) {
        return true;
    }
    if sym.flags.contains(SymbolFlags::LOCAL_LABEL) {
        return false;
    }
    if sym.segment == Segment::Undefined {
        // Referenced but never defined: becomes an external reference.
        // Unreferenced stray lookups are dropped.
        return sym.flags.contains(SymbolFlags::USED) || sym.is_external();
    }
    true
}

/// Run the back half of the pipeline and collect the module.
pub fn build_object(asm: &mut Assembler, target: &dyn TargetOps) -> AsmResult<ObjModule> {
    if !asm.frags_chained {
        chain_subsegs(asm);
    }

    let sections: Vec<SectionId> = asm.sections.keys().collect();

    // Relax and convert one section at a time; addresses are
    // section-relative.
    for &sec in &sections {
        asm.now_seg = Segment::Section(sec);
        asm.now_subseg = None;
        crate::relax::relax_segment(asm, target, sec);
    }
    for &sec in &sections {
        asm.now_seg = Segment::Section(sec);
        crate::relax::convert_frags(asm, target, sec);
        if let Some((frag, got, want)) = crate::relax::check_chain_closure(asm, sec) {
            return Err(AsmError::Internal(format!(
                "frag chain broken in {}: {frag} ends at {got:#x}, next begins at {want:#x}",
                asm.segment_name(Segment::Section(sec))
            )));
        }
        // Final size: where the terminal frag landed.
        if let Some(last) = asm.sections[sec].frag_last {
            let f = &asm.frags[last];
            asm.sections[sec].size = f.address + f.size();
        }
    }

    // Everything has an address now.
    let all_syms: Vec<SymbolId> = asm.symbols.syms.keys().collect();
    for id in all_syms {
        if !asm.symbols.syms[id].flags.contains(SymbolFlags::FAKE) {
            asm.resolve_symbol(id);
        }
    }

    for &sec in &sections {
        asm.now_seg = Segment::Section(sec);
        adjust_reloc_syms(asm, sec);
        crate::fixup::fixup_segment(asm, target, sec);
    }

    // Pick and order the output symbols: locals first, then externals,
    // as the format's linkers expect.
    let mut order: Vec<SymbolId> = Vec::new();
    for id in asm.symbols.syms.keys() {
        let sym = &asm.symbols.syms[id];
        if symbol_wanted(asm, id) && !sym.is_external() && sym.segment != Segment::Undefined {
            order.push(id);
        }
    }
    for id in asm.symbols.syms.keys() {
        let sym = &asm.symbols.syms[id];
        if symbol_wanted(asm, id) && (sym.is_external() || sym.segment == Segment::Undefined) {
            if !order.contains(&id) {
                order.push(id);
            }
        }
    }

    let mut section_index: FxHashMap<SectionId, usize> = FxHashMap::default();
    for (i, &sec) in sections.iter().enumerate() {
        section_index.insert(sec, i);
    }

    let mut symbols = Vec::with_capacity(order.len());
    let mut written: FxHashMap<SymbolId, usize> = FxHashMap::default();
    for &id in &order {
        let value = asm.resolve_symbol(id);
        let sym = &asm.symbols.syms[id];
        let name = asm.names.resolve(sym.name).to_string();
        let (home, value) = match sym.segment {
            Segment::Undefined => (ObjSymbolHome::Undefined, 0),
            Segment::Common => (ObjSymbolHome::Common, sym.size as i64),
            Segment::Debug => (ObjSymbolHome::Debug, value),
            Segment::Section(s) => (ObjSymbolHome::Section(section_index[&s]), value),
            // Anything left over resolved (or failed to resolve) to a
            // plain number.
            _ => (ObjSymbolHome::Absolute, value),
        };
        let index = symbols.len();
        symbols.push(ObjSymbol {
            name,
            value,
            home,
            external: sym.is_external() || sym.segment == Segment::Undefined,
            weak: sym.flags.contains(SymbolFlags::WEAK),
            sclass: sym.sclass,
            ty: sym.ty,
            align: sym.align,
        });
        written.insert(id, index);
        asm.symbols.syms[id].written_index = Some(index as u32);
        asm.symbols.syms[id].flags.insert(SymbolFlags::WRITTEN);
    }

    // Collect sections with their contents and relocations.
    let endian = asm.opts.endian.unwrap_or(target.default_endian());
    let mut out_sections = Vec::with_capacity(sections.len());
    for &sec in &sections {
        let has_contents = asm.sections[sec].flags.contains(SectionFlags::HAS_CONTENTS)
            && !asm.sections[sec].flags.contains(SectionFlags::BSS);
        let contents = if has_contents {
            section_contents(asm, sec)
        } else {
            Vec::new()
        };

        let mut relocs = Vec::new();
        let fixups = asm.sections[sec].fixups.clone();
        for id in fixups {
            if asm.fixups[id].done {
                continue;
            }
            let fixup = asm.fixups[id].clone();
            let Some(kind) = target.gen_reloc(asm, &fixup) else {
                let loc = fixup.loc;
                asm.diag
                    .error(loc, "cannot represent relocation in output file");
                continue;
            };
            let Some(addsy) = fixup.addsy else {
                let loc = fixup.loc;
                asm.diag.error(loc, "relocation with no symbol");
                continue;
            };
            let Some(&symbol) = written.get(&addsy) else {
                // A synthetic expression symbol leaked into a reloc: the
                // expression never reduced to something representable.
                let loc = asm
                    .symbols
                    .expr_symbol_where
                    .get(&addsy)
                    .copied()
                    .unwrap_or(fixup.loc);
                asm.diag.error(loc, "unresolved expression in relocation");
                continue;
            };
            relocs.push(ObjReloc {
                address: asm.frags[fixup.frag].address + fixup.where_ as u64,
                symbol,
                kind,
                addend: fixup.addnumber,
                pcrel: fixup.pcrel,
            });
        }

        let mut flags = asm.sections[sec].flags;
        if !relocs.is_empty() {
            flags |= SectionFlags::RELOC;
        }
        out_sections.push(ObjSection {
            name: asm.names.resolve(asm.sections[sec].name).to_string(),
            flags,
            align: asm.sections[sec].align,
            vma: asm.sections[sec].vma,
            size: asm.sections[sec].size,
            contents,
            relocs,
        });
    }

    Ok(ObjModule {
        endian,
        sections: out_sections,
        symbols,
        pic: asm.opts.pic,
        relocatable: asm.opts.relocatable || asm.opts.relocatable_lib,
    })
}

/// Build the module and drive `writer` over it.
pub fn write_object(
    asm: &mut Assembler,
    target: &dyn TargetOps,
    writer: &mut dyn ObjectWriter,
) -> AsmResult<()> {
    let module = build_object(asm, target)?;

    if asm.diag.had_errors() && !asm.opts.always_emit {
        return Ok(());
    }
    if asm.diag.had_errors() {
        let loc = asm.here();
        asm.diag
            .warn(loc, "errors were reported; the output file is bad");
    }

    writer.write_header(&module)?;
    for i in 0..module.sections.len() {
        writer.write_contents(&module, i)?;
    }
    for i in 0..module.sections.len() {
        writer.write_relocs(&module, i)?;
    }
    writer.write_symbols(&module)?;
    writer.finish(&module)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsmOptions;
    use crate::target::null_target;

    fn build(src: &str) -> (Assembler, ObjModule) {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = crate::diag::Diagnostics::silent();
        let t = null_target();
        asm.sources.push_file("t.s", src);
        crate::read::read_source(&mut asm, &*t).unwrap();
        let module = build_object(&mut asm, &*t).unwrap();
        (asm, module)
    }

    #[test]
    fn number_to_chars_orders() {
        let mut buf = [0u8; 4];
        number_to_chars(&mut buf, 0x01020304, Endian::Little);
        assert_eq!(buf, [4, 3, 2, 1]);
        number_to_chars(&mut buf, 0x01020304, Endian::Big);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn simple_module() {
        let (_, module) = build(".long 0x11223344\n.data\n.byte 9\n");
        assert_eq!(module.sections[0].name, ".text");
        assert_eq!(module.sections[0].contents, vec![0x44, 0x33, 0x22, 0x11]);
        assert_eq!(module.sections[1].name, ".data");
        assert_eq!(module.sections[1].contents, vec![9]);
        assert!(module.sections[0].relocs.is_empty());
    }

    #[test]
    fn label_difference_needs_no_reloc() {
        let (_, module) = build("a:\n.long b - a\nb:\n");
        assert!(module.sections[0].relocs.is_empty());
        assert_eq!(module.sections[0].contents, vec![4, 0, 0, 0]);
    }

    #[test]
    fn local_reloc_redirects_to_section_symbol() {
        let (asm, module) = build(".data\nvar: .long 1\n.text\n.long var\n");
        assert_eq!(asm.diag.error_count(), 0);
        let text = &module.sections[0];
        assert_eq!(text.relocs.len(), 1);
        let reloc = &text.relocs[0];
        let sym = &module.symbols[reloc.symbol];
        assert_eq!(sym.name, ".data");
        assert_eq!(sym.home, ObjSymbolHome::Section(1));
        // The bytes hold the section-relative address of `var`.
        assert_eq!(text.contents, vec![0, 0, 0, 0]);
    }

    #[test]
    fn undefined_symbol_reloc_survives() {
        let (asm, module) = build(".long external_thing + 4\n");
        assert_eq!(asm.diag.error_count(), 0);
        let text = &module.sections[0];
        assert_eq!(text.relocs.len(), 1);
        let sym = &module.symbols[text.relocs[0].symbol];
        assert_eq!(sym.name, "external_thing");
        assert_eq!(sym.home, ObjSymbolHome::Undefined);
        assert!(sym.external);
        // Addend lives in the section bytes.
        assert_eq!(text.contents, vec![4, 0, 0, 0]);
        assert_eq!(text.relocs[0].addend, 4);
    }

    #[test]
    fn common_symbol_output() {
        let (_, module) = build(".comm shared, 16, 8\n");
        let sym = module
            .symbols
            .iter()
            .find(|s| s.name == "shared")
            .expect("common emitted");
        assert_eq!(sym.home, ObjSymbolHome::Common);
        assert_eq!(sym.value, 16);
        assert_eq!(sym.align, 3);
        assert!(sym.external);
    }

    #[test]
    fn locals_precede_externals() {
        let (_, module) = build("local:\n.globl ext\next:\n.long local\n.long ext\n");
        let local_pos = module.symbols.iter().position(|s| !s.external);
        let ext_pos = module.symbols.iter().position(|s| s.name == "ext").unwrap();
        if let Some(lp) = local_pos {
            assert!(lp < ext_pos);
        }
    }
}
