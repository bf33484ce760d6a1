//! Reading object files into their internal form.

use crate::types::{AuxEntry, FileHeader, Lineno, Reloc, SectionHeader, SymEntry, Syment};
use crate::{ObjectError, FILHSZ, LINESZ, RELSZ, SCNHSZ, SYMESZ};
use ferrite_asm::context::Endian;

/// One section with its raw data and relocation/line-number tables.
#[derive(Debug, Clone)]
pub struct CoffSection {
    /// The decoded header.
    pub header: SectionHeader,
    /// Raw contents (empty for bss).
    pub data: Vec<u8>,
    /// Relocations, in file order.
    pub relocs: Vec<Reloc>,
    /// Line numbers, in file order.
    pub linenos: Vec<Lineno>,
}

/// A fully decoded object file.
#[derive(Debug)]
pub struct CoffObject {
    /// Source the object was read from, for diagnostics.
    pub name: String,
    /// Byte order.
    pub endian: Endian,
    /// The file header.
    pub header: FileHeader,
    /// Sections, in file order. Section numbers in symbols are 1-based
    /// indices into this list.
    pub sections: Vec<CoffSection>,
    /// The raw symbol table: one slot per entry, aux slots included, so
    /// that symbol indices match the file.
    pub symbols: Vec<SymEntry>,
    /// The raw string table (without the leading length field).
    pub strings: Vec<u8>,
}

impl CoffObject {
    /// Decode an object file image.
    pub fn parse(name: impl Into<String>, data: &[u8]) -> Result<Self, ObjectError> {
        let name = name.into();
        let (header, endian) = FileHeader::parse(data)?;

        // The string table sits after the symbol table; load it first so
        // names can be resolved while decoding everything else.
        let strings = {
            let strtab_at = header.symptr as usize + header.nsyms as usize * SYMESZ;
            match data.get(strtab_at..strtab_at + 4) {
                None => Vec::new(),
                Some(lenb) => {
                    let len = match endian {
                        Endian::Little => {
                            u32::from_le_bytes(lenb.try_into().expect("4 bytes"))
                        }
                        Endian::Big => u32::from_be_bytes(lenb.try_into().expect("4 bytes")),
                    } as usize;
                    if len < 4 || strtab_at + len > data.len() {
                        Vec::new()
                    } else {
                        data[strtab_at + 4..strtab_at + len].to_vec()
                    }
                }
            }
        };

        let mut sections = Vec::with_capacity(header.nscns as usize);
        let mut at = FILHSZ + header.opthdr as usize;
        for _ in 0..header.nscns {
            let hdr_bytes = data
                .get(at..at + SCNHSZ)
                .ok_or_else(|| ObjectError::Malformed("section headers truncated".into()))?;
            let hdr = SectionHeader::parse(hdr_bytes, endian, &strings)?;
            at += SCNHSZ;

            let contents = if hdr.scnptr != 0 && hdr.size != 0 {
                let start = hdr.scnptr as usize;
                let end = start + hdr.size as usize;
                data.get(start..end)
                    .ok_or_else(|| {
                        ObjectError::Malformed(format!("contents of `{}` truncated", hdr.name))
                    })?
                    .to_vec()
            } else {
                Vec::new()
            };

            let mut relocs = Vec::with_capacity(hdr.nreloc as usize);
            let mut rat = hdr.relptr as usize;
            for _ in 0..hdr.nreloc {
                let buf = data
                    .get(rat..rat + RELSZ)
                    .ok_or_else(|| ObjectError::Malformed("relocations truncated".into()))?;
                relocs.push(Reloc::parse(buf, endian)?);
                rat += RELSZ;
            }

            let mut linenos = Vec::with_capacity(hdr.nlnno as usize);
            let mut lat = hdr.lnnoptr as usize;
            for _ in 0..hdr.nlnno {
                let buf = data
                    .get(lat..lat + LINESZ)
                    .ok_or_else(|| ObjectError::Malformed("line numbers truncated".into()))?;
                linenos.push(Lineno::parse(buf, endian)?);
                lat += LINESZ;
            }

            sections.push(CoffSection {
                header: hdr,
                data: contents,
                relocs,
                linenos,
            });
        }
        log::debug!(
            "{name}: {} section(s), {} symbol entries",
            sections.len(),
            header.nsyms
        );

        // Symbol table: symbols interleaved with their aux entries.
        let mut symbols = Vec::with_capacity(header.nsyms as usize);
        let mut at = header.symptr as usize;
        let mut i = 0u32;
        while i < header.nsyms {
            let buf = data
                .get(at..at + SYMESZ)
                .ok_or_else(|| ObjectError::Malformed("symbol table truncated".into()))?;
            let sym = Syment::parse(buf, endian, &strings)?;
            at += SYMESZ;
            i += 1;
            let numaux = sym.numaux;
            let (sclass, ty) = (sym.sclass, sym.ty);
            symbols.push(SymEntry::Sym(sym));
            for _ in 0..numaux {
                if i >= header.nsyms {
                    return Err(ObjectError::Malformed(
                        "aux entries run past the symbol table".into(),
                    ));
                }
                let buf = data
                    .get(at..at + SYMESZ)
                    .ok_or_else(|| ObjectError::Malformed("symbol table truncated".into()))?;
                symbols.push(SymEntry::Aux(AuxEntry::parse(
                    buf, endian, sclass, ty, &strings,
                )?));
                at += SYMESZ;
                i += 1;
            }
        }

        Ok(Self {
            name,
            endian,
            header,
            sections,
            symbols,
            strings,
        })
    }

    /// Read and decode an object file from disk.
    pub fn open(path: &std::path::Path) -> Result<Self, ObjectError> {
        let data = std::fs::read(path)?;
        Self::parse(path.display().to_string(), &data)
    }

    /// Find a section by name.
    pub fn section_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.header.name == name)
    }

    /// The symbol at raw index `index`, if that slot holds a symbol.
    pub fn symbol(&self, index: usize) -> Option<&Syment> {
        self.symbols.get(index).and_then(SymEntry::as_sym)
    }
}
