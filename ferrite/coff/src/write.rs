//! Writing object files.
//!
//! `CoffWriter` implements the assembler's abstract object-writer
//! interface over this format. The whole image is laid out up front
//! (headers, raw data, relocations, symbols, strings) and assembled in
//! memory; nothing here seeks in a real file until the image is complete.

use crate::types::{rtype_from_kind, FileHeader, SectionHeader, Syment};
use crate::{
    ObjectError, C_EXT, C_STAT, C_WEAKEXT, FILHSZ, MAGIC_BE, MAGIC_LE, N_ABS, N_DEBUG, N_UNDEF,
    RELSZ, SCNHSZ, SCNNMLEN, STYP_BSS, STYP_DATA, STYP_INFO, STYP_NOLOAD, STYP_READONLY,
    STYP_TEXT, SYMESZ, SYMNMLEN,
};
use ferrite_asm::context::Endian;
use ferrite_asm::intern::StringTable;
use ferrite_asm::section::SectionFlags;
use ferrite_asm::write::{ObjModule, ObjSymbolHome, ObjectWriter, WriteError};

#[derive(Debug, Default, Clone, Copy)]
struct SectionLayout {
    scnptr: u32,
    relptr: u32,
}

/// An in-memory object-file writer.
#[derive(Default)]
pub struct CoffWriter {
    buf: Vec<u8>,
    layout: Vec<SectionLayout>,
    long_names: Vec<Option<u32>>,
    symptr: u32,
    strtab: StringTable,
    endian: Endian,
}

impl CoffWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            layout: Vec::new(),
            long_names: Vec::new(),
            symptr: 0,
            strtab: StringTable::new(),
            endian: Endian::Little,
        }
    }

    /// Consume the writer, returning the finished image.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write the finished image to `path`.
    pub fn write_to(self, path: &std::path::Path) -> Result<(), ObjectError> {
        std::fs::write(path, self.buf)?;
        Ok(())
    }

    fn put_at(&mut self, at: usize, bytes: &[u8]) {
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn section_styp(flags: SectionFlags) -> u32 {
        let mut styp = 0;
        if flags.contains(SectionFlags::CODE) {
            styp |= STYP_TEXT;
        }
        if flags.contains(SectionFlags::BSS) {
            styp |= STYP_BSS;
        }
        if flags.contains(SectionFlags::DATA) {
            styp |= STYP_DATA;
        }
        if flags.contains(SectionFlags::DEBUG) {
            styp |= STYP_INFO;
        }
        if flags.contains(SectionFlags::READONLY) {
            styp |= STYP_READONLY;
        }
        if flags.contains(SectionFlags::NEVER_LOAD) {
            styp |= STYP_NOLOAD;
        }
        if styp == 0 {
            styp = STYP_DATA;
        }
        styp
    }
}

impl ObjectWriter for CoffWriter {
    fn write_header(&mut self, module: &ObjModule) -> Result<(), WriteError> {
        self.endian = module.endian;
        let nscns = module.sections.len();
        if nscns > u16::MAX as usize {
            return Err(WriteError::TooLarge(format!("{nscns} sections")));
        }

        // Long section names go into the string table first; their
        // offsets are part of the headers.
        self.long_names = module
            .sections
            .iter()
            .map(|s| {
                if s.name.len() > SCNNMLEN {
                    Some(self.strtab.add_no_hash(&s.name))
                } else {
                    None
                }
            })
            .collect();

        // Lay the file out: headers, raw data, relocations, symbols.
        let mut offset = (FILHSZ + nscns * SCNHSZ) as u32;
        self.layout = vec![SectionLayout::default(); nscns];
        for (i, s) in module.sections.iter().enumerate() {
            if !s.contents.is_empty() {
                offset = (offset + 3) & !3;
                self.layout[i].scnptr = offset;
                offset += s.contents.len() as u32;
            }
        }
        for (i, s) in module.sections.iter().enumerate() {
            if !s.relocs.is_empty() {
                if s.relocs.len() > u16::MAX as usize {
                    return Err(WriteError::TooLarge(format!(
                        "{} relocations in `{}`",
                        s.relocs.len(),
                        s.name
                    )));
                }
                self.layout[i].relptr = offset;
                offset += (s.relocs.len() * RELSZ) as u32;
            }
        }
        self.symptr = offset;

        let nsyms = module.symbols.len() as u32;
        self.buf = vec![0u8; (self.symptr + nsyms * SYMESZ as u32) as usize];

        let total_relocs: usize = module.sections.iter().map(|s| s.relocs.len()).sum();
        let mut flags = crate::F_LNNO;
        if total_relocs == 0 {
            flags |= crate::F_RELFLG;
        }
        if module.pic {
            flags |= crate::F_PIC;
        }
        if module.relocatable {
            flags |= crate::F_RELOCATABLE;
        }

        let header = FileHeader {
            magic: match self.endian {
                Endian::Little => MAGIC_LE,
                Endian::Big => MAGIC_BE,
            },
            nscns: nscns as u16,
            timdat: 0,
            symptr: self.symptr,
            nsyms,
            opthdr: 0,
            flags,
        };
        let bytes = header.emit(self.endian);
        self.put_at(0, &bytes);

        for (i, s) in module.sections.iter().enumerate() {
            let hdr = SectionHeader {
                name: s.name.clone(),
                paddr: s.vma as u32,
                vaddr: s.vma as u32,
                size: s.size as u32,
                scnptr: self.layout[i].scnptr,
                relptr: self.layout[i].relptr,
                lnnoptr: 0,
                nreloc: s.relocs.len() as u16,
                nlnno: 0,
                flags: Self::section_styp(s.flags),
            };
            let bytes = hdr.emit(self.endian, self.long_names[i]);
            self.put_at(FILHSZ + i * SCNHSZ, &bytes);
        }
        Ok(())
    }

    fn write_contents(&mut self, module: &ObjModule, section: usize) -> Result<(), WriteError> {
        let s = &module.sections[section];
        if s.contents.is_empty() {
            return Ok(());
        }
        let at = self.layout[section].scnptr as usize;
        let contents = s.contents.clone();
        self.put_at(at, &contents);
        Ok(())
    }

    fn write_relocs(&mut self, module: &ObjModule, section: usize) -> Result<(), WriteError> {
        let s = &module.sections[section];
        let mut at = self.layout[section].relptr as usize;
        for reloc in &s.relocs {
            let rtype = rtype_from_kind(reloc.kind).ok_or_else(|| {
                WriteError::Unrepresentable(format!("relocation kind {}", reloc.kind))
            })?;
            // Every output symbol is exactly one entry wide (no aux), so
            // the module index is the raw symbol index.
            let wire = crate::types::Reloc {
                vaddr: (s.vma + reloc.address) as u32,
                symndx: reloc.symbol as i32,
                rtype,
            };
            let bytes = wire.emit(self.endian);
            self.put_at(at, &bytes);
            at += RELSZ;
        }
        Ok(())
    }

    fn write_symbols(&mut self, module: &ObjModule) -> Result<(), WriteError> {
        let mut at = self.symptr as usize;
        for sym in &module.symbols {
            let (scnum, value) = match sym.home {
                ObjSymbolHome::Undefined => (N_UNDEF, 0u32),
                ObjSymbolHome::Absolute => (N_ABS, sym.value as u32),
                ObjSymbolHome::Debug => (N_DEBUG, sym.value as u32),
                // Section numbers are 1-based on the wire; 0 is N_UNDEF.
                ObjSymbolHome::Section(i) => ((i + 1) as i16, sym.value as u32),
                ObjSymbolHome::Common => (N_UNDEF, sym.value as u32),
            };
            let sclass = if sym.sclass != 0 {
                sym.sclass
            } else if sym.weak {
                C_WEAKEXT
            } else if sym.external {
                C_EXT
            } else {
                C_STAT
            };

            let long_name_offset = if sym.name.len() > SYMNMLEN {
                Some(self.strtab.add(&sym.name))
            } else {
                None
            };
            let wire = Syment {
                name: sym.name.clone(),
                value,
                scnum,
                ty: sym.ty,
                sclass,
                numaux: 0,
            };
            let bytes = wire.emit(self.endian, long_name_offset);
            self.put_at(at, &bytes);
            at += SYMESZ;
        }
        Ok(())
    }

    fn finish(&mut self, _module: &ObjModule) -> Result<(), WriteError> {
        // String table directly after the symbols; always emitted so the
        // reader can rely on the length field being present.
        let table = self.strtab.emit();
        self.buf.extend_from_slice(&table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoffObject;
    use ferrite_asm::context::{AsmOptions, Assembler};
    use ferrite_asm::target::falcon::Falcon;
    use ferrite_asm::write::write_object;

    fn assemble_to_coff(src: &str) -> CoffObject {
        let mut asm = Assembler::new(AsmOptions::default());
        asm.diag = ferrite_asm::diag::Diagnostics::silent();
        let falcon = Falcon::new();
        asm.sources.push_file("t.s", src);
        ferrite_asm::read::read_source(&mut asm, &falcon).unwrap();
        let mut writer = CoffWriter::new();
        write_object(&mut asm, &falcon, &mut writer).unwrap();
        assert_eq!(asm.diag.error_count(), 0, "{:?}", asm.diag.reports());
        CoffObject::parse("t.o", &writer.into_bytes()).unwrap()
    }

    #[test]
    fn assembled_object_parses_back() {
        let obj = assemble_to_coff("entry:\n nop\n li r1, 5\n.data\n.long 0x11223344\n");
        assert_eq!(obj.sections[0].header.name, ".text");
        assert_eq!(obj.sections[0].data.len(), 8);
        assert_eq!(obj.sections[1].header.name, ".data");
        assert_eq!(obj.sections[1].data, vec![0x44, 0x33, 0x22, 0x11]);

        let entry = obj
            .symbols
            .iter()
            .filter_map(|e| e.as_sym())
            .find(|s| s.name == "entry")
            .expect("label kept");
        assert_eq!(entry.scnum, 1);
        assert_eq!(entry.value, 0);
    }

    #[test]
    fn undefined_reference_produces_reloc() {
        let obj = assemble_to_coff(".long missing\n");
        let text = &obj.sections[0];
        assert_eq!(text.relocs.len(), 1);
        let r = text.relocs[0];
        assert_eq!(r.rtype, crate::types::R_DIR32);
        let target = obj.symbol(r.symndx as usize).expect("symbol slot");
        assert_eq!(target.name, "missing");
        assert_eq!(target.scnum, N_UNDEF);
        assert_eq!(target.sclass, C_EXT);
    }

    #[test]
    fn long_symbol_names_hit_string_table() {
        let obj =
            assemble_to_coff(".globl a_rather_long_symbol_name\na_rather_long_symbol_name:\n nop\n");
        let sym = obj
            .symbols
            .iter()
            .filter_map(|e| e.as_sym())
            .find(|s| s.name == "a_rather_long_symbol_name")
            .expect("long name resolved via strtab");
        assert_eq!(sym.scnum, 1);
        assert!(!obj.strings.is_empty());
    }

    #[test]
    fn big_endian_object() {
        let mut asm = Assembler::new(AsmOptions {
            endian: Some(Endian::Big),
            ..Default::default()
        });
        asm.diag = ferrite_asm::diag::Diagnostics::silent();
        let falcon = Falcon::new();
        asm.sources.push_file("t.s", ".long 0x11223344\n");
        ferrite_asm::read::read_source(&mut asm, &falcon).unwrap();
        let mut writer = CoffWriter::new();
        write_object(&mut asm, &falcon, &mut writer).unwrap();
        let obj = CoffObject::parse("t.o", &writer.into_bytes()).unwrap();
        assert_eq!(obj.endian, Endian::Big);
        assert_eq!(obj.sections[0].data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn common_symbol_round_trips() {
        let obj = assemble_to_coff(".comm c1, 16, 4\n");
        let sym = obj
            .symbols
            .iter()
            .filter_map(|e| e.as_sym())
            .find(|s| s.name == "c1")
            .expect("common symbol");
        assert_eq!(sym.scnum, N_UNDEF);
        assert_eq!(sym.value, 16);
        assert_eq!(sym.sclass, C_EXT);
    }
}
