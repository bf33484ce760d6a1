//! Internal forms of the wire structures, with swap-in/swap-out routines.

use crate::encode::{get_i16, get_i32, get_u16, get_u32, put_i16, put_i32, put_u16, put_u32};
use crate::{ObjectError, FILHSZ, LINESZ, RELSZ, SCNHSZ, SCNNMLEN, SYMESZ, SYMNMLEN};
use ferrite_asm::context::Endian;
use ferrite_asm::target::RelocKind;

/// Wire relocation type: absolute 1-byte field.
pub const R_DIR8: u16 = 0x01;
/// Absolute 2-byte field.
pub const R_DIR16: u16 = 0x02;
/// Absolute 4-byte field.
pub const R_DIR32: u16 = 0x06;
/// Absolute 8-byte field.
pub const R_DIR64: u16 = 0x0f;
/// PC-relative 1-byte field.
pub const R_PCR8: u16 = 0x08;
/// PC-relative 2-byte field.
pub const R_PCR16: u16 = 0x09;
/// PC-relative 4-byte field.
pub const R_PCR32: u16 = 0x0a;
/// Image-relative 4-byte field.
pub const R_IMGREL32: u16 = 0x0b;
/// Low 16 bits of a 32-bit value.
pub const R_LO16: u16 = 0x10;
/// High 16 bits of a 32-bit value.
pub const R_HI16: u16 = 0x11;
/// High 16 bits, carry-adjusted.
pub const R_HA16: u16 = 0x12;
/// 26-bit branch displacement.
pub const R_BR26: u16 = 0x13;

/// Map an internal relocation kind to its wire type.
pub fn rtype_from_kind(kind: RelocKind) -> Option<u16> {
    Some(match kind {
        RelocKind::Abs8 => R_DIR8,
        RelocKind::Abs16 => R_DIR16,
        RelocKind::Abs32 => R_DIR32,
        RelocKind::Abs64 => R_DIR64,
        RelocKind::PcRel8 => R_PCR8,
        RelocKind::PcRel16 => R_PCR16,
        RelocKind::PcRel32 => R_PCR32,
        RelocKind::Rva32 => R_IMGREL32,
        RelocKind::Lo16 => R_LO16,
        RelocKind::Hi16 => R_HI16,
        RelocKind::Ha16 => R_HA16,
        RelocKind::Branch26 => R_BR26,
        RelocKind::TargetOperand(_) => return None,
    })
}

/// Map a wire relocation type back to the internal kind.
pub fn kind_from_rtype(rtype: u16) -> Option<RelocKind> {
    Some(match rtype {
        R_DIR8 => RelocKind::Abs8,
        R_DIR16 => RelocKind::Abs16,
        R_DIR32 => RelocKind::Abs32,
        R_DIR64 => RelocKind::Abs64,
        R_PCR8 => RelocKind::PcRel8,
        R_PCR16 => RelocKind::PcRel16,
        R_PCR32 => RelocKind::PcRel32,
        R_IMGREL32 => RelocKind::Rva32,
        R_LO16 => RelocKind::Lo16,
        R_HI16 => RelocKind::Hi16,
        R_HA16 => RelocKind::Ha16,
        R_BR26 => RelocKind::Branch26,
        _ => return None,
    })
}

/// The file header.
#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    /// Magic number; decides the byte order.
    pub magic: u16,
    /// Number of sections.
    pub nscns: u16,
    /// Timestamp.
    pub timdat: u32,
    /// File offset of the symbol table.
    pub symptr: u32,
    /// Number of symbol-table entries, aux entries included.
    pub nsyms: u32,
    /// Size of the optional header (always zero here).
    pub opthdr: u16,
    /// Flag bits (`F_*`).
    pub flags: u16,
}

impl FileHeader {
    /// Decode from the first [`FILHSZ`] bytes.
    pub fn parse(buf: &[u8]) -> Result<(Self, Endian), ObjectError> {
        if buf.len() < FILHSZ {
            return Err(ObjectError::Malformed("truncated file header".into()));
        }
        let magic_le = u16::from_le_bytes([buf[0], buf[1]]);
        let magic_be = u16::from_be_bytes([buf[0], buf[1]]);
        let endian = if magic_le == crate::MAGIC_LE {
            Endian::Little
        } else if magic_be == crate::MAGIC_BE {
            Endian::Big
        } else {
            return Err(ObjectError::BadMagic(magic_le));
        };
        let h = Self {
            magic: get_u16(buf, 0, endian),
            nscns: get_u16(buf, 2, endian),
            timdat: get_u32(buf, 4, endian),
            symptr: get_u32(buf, 8, endian),
            nsyms: get_u32(buf, 12, endian),
            opthdr: get_u16(buf, 16, endian),
            flags: get_u16(buf, 18, endian),
        };
        Ok((h, endian))
    }

    /// Encode into [`FILHSZ`] bytes.
    pub fn emit(&self, endian: Endian) -> [u8; FILHSZ] {
        let mut buf = [0u8; FILHSZ];
        put_u16(&mut buf, 0, self.magic, endian);
        put_u16(&mut buf, 2, self.nscns, endian);
        put_u32(&mut buf, 4, self.timdat, endian);
        put_u32(&mut buf, 8, self.symptr, endian);
        put_u32(&mut buf, 12, self.nsyms, endian);
        put_u16(&mut buf, 16, self.opthdr, endian);
        put_u16(&mut buf, 18, self.flags, endian);
        buf
    }
}

/// A section header, with the name already resolved.
#[derive(Debug, Clone, Default)]
pub struct SectionHeader {
    /// Section name (long names resolved through the string table).
    pub name: String,
    /// Physical address.
    pub paddr: u32,
    /// Virtual address.
    pub vaddr: u32,
    /// Size in bytes.
    pub size: u32,
    /// File offset of the raw data.
    pub scnptr: u32,
    /// File offset of the relocations.
    pub relptr: u32,
    /// File offset of the line numbers.
    pub lnnoptr: u32,
    /// Number of relocations.
    pub nreloc: u16,
    /// Number of line-number entries.
    pub nlnno: u16,
    /// Section flags (`STYP_*`).
    pub flags: u32,
}

impl SectionHeader {
    /// Decode a header, looking long names up in `strings`.
    pub fn parse(buf: &[u8], endian: Endian, strings: &[u8]) -> Result<Self, ObjectError> {
        if buf.len() < SCNHSZ {
            return Err(ObjectError::Malformed("truncated section header".into()));
        }
        let raw_name = &buf[0..SCNNMLEN];
        let name = if raw_name[0] == b'/' {
            // `/<decimal>`: offset into the string table.
            let digits: String = raw_name[1..]
                .iter()
                .take_while(|&&b| b.is_ascii_digit())
                .map(|&b| b as char)
                .collect();
            let offset: usize = digits
                .parse()
                .map_err(|_| ObjectError::Malformed("bad long section name".into()))?;
            string_at(strings, offset)?
        } else {
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(SCNNMLEN);
            String::from_utf8_lossy(&raw_name[..end]).into_owned()
        };

        Ok(Self {
            name,
            paddr: get_u32(buf, 8, endian),
            vaddr: get_u32(buf, 12, endian),
            size: get_u32(buf, 16, endian),
            scnptr: get_u32(buf, 20, endian),
            relptr: get_u32(buf, 24, endian),
            lnnoptr: get_u32(buf, 28, endian),
            nreloc: get_u16(buf, 32, endian),
            nlnno: get_u16(buf, 34, endian),
            flags: get_u32(buf, 36, endian),
        })
    }

    /// Encode. `long_name_offset` must be supplied when the name exceeds
    /// the inline limit; the header then carries `/<decimal>`.
    pub fn emit(&self, endian: Endian, long_name_offset: Option<u32>) -> [u8; SCNHSZ] {
        let mut buf = [0u8; SCNHSZ];
        match long_name_offset {
            Some(off) => {
                let s = format!("/{off}");
                buf[..s.len().min(SCNNMLEN)].copy_from_slice(&s.as_bytes()[..s.len().min(SCNNMLEN)]);
            }
            None => {
                let bytes = self.name.as_bytes();
                let n = bytes.len().min(SCNNMLEN);
                buf[..n].copy_from_slice(&bytes[..n]);
            }
        }
        put_u32(&mut buf, 8, self.paddr, endian);
        put_u32(&mut buf, 12, self.vaddr, endian);
        put_u32(&mut buf, 16, self.size, endian);
        put_u32(&mut buf, 20, self.scnptr, endian);
        put_u32(&mut buf, 24, self.relptr, endian);
        put_u32(&mut buf, 28, self.lnnoptr, endian);
        put_u16(&mut buf, 32, self.nreloc, endian);
        put_u16(&mut buf, 34, self.nlnno, endian);
        put_u32(&mut buf, 36, self.flags, endian);
        buf
    }
}

/// Fetch the NUL-terminated string at `offset` in a raw string table
/// (offset includes the 4-byte length field).
pub fn string_at(strings: &[u8], offset: usize) -> Result<String, ObjectError> {
    let start = offset
        .checked_sub(4)
        .ok_or_else(|| ObjectError::Malformed("string offset inside length field".into()))?;
    let tail = strings
        .get(start..)
        .ok_or_else(|| ObjectError::Malformed("string offset out of range".into()))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ObjectError::Malformed("unterminated string".into()))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// An internal symbol entry, name resolved.
#[derive(Debug, Clone, Default)]
pub struct Syment {
    /// Symbol name.
    pub name: String,
    /// Value: address, constant, or common size.
    pub value: u32,
    /// Section number, or `N_UNDEF`/`N_ABS`/`N_DEBUG`.
    pub scnum: i16,
    /// Type word.
    pub ty: u16,
    /// Storage class.
    pub sclass: u8,
    /// Number of following auxiliary entries.
    pub numaux: u8,
}

impl Syment {
    /// Is this an externally visible definition or reference?
    pub fn is_global_class(&self) -> bool {
        matches!(self.sclass, crate::C_EXT | crate::C_WEAKEXT)
    }

    /// Decode one entry; long names resolve through `strings`.
    pub fn parse(buf: &[u8], endian: Endian, strings: &[u8]) -> Result<Self, ObjectError> {
        if buf.len() < SYMESZ {
            return Err(ObjectError::Malformed("truncated symbol entry".into()));
        }
        let name = if buf[0] == 0 && buf[1] == 0 && buf[2] == 0 && buf[3] == 0 {
            let offset = get_u32(buf, 4, endian) as usize;
            if offset == 0 {
                String::new()
            } else {
                string_at(strings, offset)?
            }
        } else {
            let end = buf[..SYMNMLEN]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(SYMNMLEN);
            String::from_utf8_lossy(&buf[..end]).into_owned()
        };
        Ok(Self {
            name,
            value: get_u32(buf, 8, endian),
            scnum: get_i16(buf, 12, endian),
            ty: get_u16(buf, 14, endian),
            sclass: buf[16],
            numaux: buf[17],
        })
    }

    /// Encode. `long_name_offset` is required when the name is longer
    /// than the inline field.
    pub fn emit(&self, endian: Endian, long_name_offset: Option<u32>) -> [u8; SYMESZ] {
        let mut buf = [0u8; SYMESZ];
        match long_name_offset {
            Some(off) => {
                put_u32(&mut buf, 0, 0, endian);
                put_u32(&mut buf, 4, off, endian);
            }
            None => {
                let bytes = self.name.as_bytes();
                let n = bytes.len().min(SYMNMLEN);
                buf[..n].copy_from_slice(&bytes[..n]);
            }
        }
        put_u32(&mut buf, 8, self.value, endian);
        put_i16(&mut buf, 12, self.scnum, endian);
        put_u16(&mut buf, 14, self.ty, endian);
        buf[16] = self.sclass;
        buf[17] = self.numaux;
        buf
    }
}

/// A decoded auxiliary entry. Layouts depend on the owning symbol's
/// storage class and type; anything unrecognized is carried raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxEntry {
    /// `C_FILE` aux: the file name (possibly via the string table).
    File {
        /// Resolved name.
        name: String,
    },
    /// Section aux on a `C_STAT` section symbol.
    Section {
        /// Section length.
        length: u32,
        /// Relocation count.
        nreloc: u16,
        /// Line-number count.
        nlnno: u16,
    },
    /// Function (or `.bf`/`.bb`) aux.
    Function {
        /// Tag index.
        tagndx: u32,
        /// Function size.
        fsize: u32,
        /// File offset of the first line number.
        lnnoptr: u32,
        /// Index of the next entry past this scope.
        endndx: u32,
    },
    /// Struct/union/enum tag aux.
    Tag {
        /// Size of the type.
        size: u16,
        /// Index past the `C_EOS` closing the tag.
        endndx: u32,
    },
    /// End-of-structure aux.
    Eos {
        /// Tag index this closes.
        tagndx: u32,
        /// Size of the type.
        size: u16,
    },
    /// Uninterpreted bytes.
    Raw([u8; SYMESZ]),
}

impl AuxEntry {
    /// Decode an aux record for a symbol of the given class/type.
    pub fn parse(
        buf: &[u8],
        endian: Endian,
        sclass: u8,
        ty: u16,
        strings: &[u8],
    ) -> Result<Self, ObjectError> {
        if buf.len() < SYMESZ {
            return Err(ObjectError::Malformed("truncated aux entry".into()));
        }
        let raw: [u8; SYMESZ] = buf[..SYMESZ].try_into().expect("length checked");

        if sclass == crate::C_FILE {
            let name = if raw[0] == 0 && raw[1] == 0 && raw[2] == 0 && raw[3] == 0 {
                let offset = get_u32(&raw, 4, endian) as usize;
                if offset == 0 {
                    String::new()
                } else {
                    string_at(strings, offset)?
                }
            } else {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(SYMESZ);
                String::from_utf8_lossy(&raw[..end]).into_owned()
            };
            return Ok(AuxEntry::File { name });
        }
        if sclass == crate::C_STAT && ty == 0 {
            return Ok(AuxEntry::Section {
                length: get_u32(&raw, 0, endian),
                nreloc: get_u16(&raw, 4, endian),
                nlnno: get_u16(&raw, 6, endian),
            });
        }
        if crate::is_function_type(ty) || sclass == crate::C_BLOCK || sclass == crate::C_FCN {
            return Ok(AuxEntry::Function {
                tagndx: get_u32(&raw, 0, endian),
                fsize: get_u32(&raw, 4, endian),
                lnnoptr: get_u32(&raw, 8, endian),
                endndx: get_u32(&raw, 12, endian),
            });
        }
        if crate::is_tag_class(sclass) {
            return Ok(AuxEntry::Tag {
                size: get_u16(&raw, 6, endian),
                endndx: get_u32(&raw, 12, endian),
            });
        }
        if sclass == crate::C_EOS {
            return Ok(AuxEntry::Eos {
                tagndx: get_u32(&raw, 0, endian),
                size: get_u16(&raw, 6, endian),
            });
        }
        Ok(AuxEntry::Raw(raw))
    }

    /// Encode back to the wire. Long file names must already have been
    /// placed in the string table by the caller.
    pub fn emit(&self, endian: Endian, file_name_offset: Option<u32>) -> [u8; SYMESZ] {
        let mut buf = [0u8; SYMESZ];
        match self {
            AuxEntry::File { name } => match file_name_offset {
                Some(off) => {
                    put_u32(&mut buf, 0, 0, endian);
                    put_u32(&mut buf, 4, off, endian);
                }
                None => {
                    let bytes = name.as_bytes();
                    let n = bytes.len().min(SYMESZ);
                    buf[..n].copy_from_slice(&bytes[..n]);
                }
            },
            AuxEntry::Section {
                length,
                nreloc,
                nlnno,
            } => {
                put_u32(&mut buf, 0, *length, endian);
                put_u16(&mut buf, 4, *nreloc, endian);
                put_u16(&mut buf, 6, *nlnno, endian);
            }
            AuxEntry::Function {
                tagndx,
                fsize,
                lnnoptr,
                endndx,
            } => {
                put_u32(&mut buf, 0, *tagndx, endian);
                put_u32(&mut buf, 4, *fsize, endian);
                put_u32(&mut buf, 8, *lnnoptr, endian);
                put_u32(&mut buf, 12, *endndx, endian);
            }
            AuxEntry::Tag { size, endndx } => {
                put_u16(&mut buf, 6, *size, endian);
                put_u32(&mut buf, 12, *endndx, endian);
            }
            AuxEntry::Eos { tagndx, size } => {
                put_u32(&mut buf, 0, *tagndx, endian);
                put_u16(&mut buf, 6, *size, endian);
            }
            AuxEntry::Raw(raw) => buf.copy_from_slice(raw),
        }
        buf
    }
}

/// An internal relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    /// Address of the field, section-relative plus section vma.
    pub vaddr: u32,
    /// Symbol-table index of the target symbol.
    pub symndx: i32,
    /// Wire relocation type.
    pub rtype: u16,
}

impl Reloc {
    /// Decode one record.
    pub fn parse(buf: &[u8], endian: Endian) -> Result<Self, ObjectError> {
        if buf.len() < RELSZ {
            return Err(ObjectError::Malformed("truncated relocation".into()));
        }
        Ok(Self {
            vaddr: get_u32(buf, 0, endian),
            symndx: get_i32(buf, 4, endian),
            rtype: get_u16(buf, 8, endian),
        })
    }

    /// Encode one record.
    pub fn emit(&self, endian: Endian) -> [u8; RELSZ] {
        let mut buf = [0u8; RELSZ];
        put_u32(&mut buf, 0, self.vaddr, endian);
        put_i32(&mut buf, 4, self.symndx, endian);
        put_u16(&mut buf, 8, self.rtype, endian);
        buf
    }
}

/// A line-number record. `lnno == 0` associates the entry with a symbol,
/// otherwise `addr` is a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineno {
    /// Symbol index (when `lnno == 0`) or physical address.
    pub addr: u32,
    /// Line number; zero marks a function-start entry.
    pub lnno: u16,
}

impl Lineno {
    /// Decode one record.
    pub fn parse(buf: &[u8], endian: Endian) -> Result<Self, ObjectError> {
        if buf.len() < LINESZ {
            return Err(ObjectError::Malformed("truncated line number".into()));
        }
        Ok(Self {
            addr: get_u32(buf, 0, endian),
            lnno: get_u16(buf, 4, endian),
        })
    }

    /// Encode one record.
    pub fn emit(&self, endian: Endian) -> [u8; LINESZ] {
        let mut buf = [0u8; LINESZ];
        put_u32(&mut buf, 0, self.addr, endian);
        put_u16(&mut buf, 4, self.lnno, endian);
        buf
    }
}

/// One slot of the raw symbol table: a symbol or one of its aux records.
/// Keeping aux records in their slots preserves raw symbol indices, which
/// everything downstream (relocations, endndx chains) relies on.
#[derive(Debug, Clone)]
pub enum SymEntry {
    /// A symbol.
    Sym(Syment),
    /// An auxiliary record belonging to the preceding symbol.
    Aux(AuxEntry),
}

impl SymEntry {
    /// The symbol, if this slot holds one.
    pub fn as_sym(&self) -> Option<&Syment> {
        match self {
            SymEntry::Sym(s) => Some(s),
            SymEntry::Aux(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trip() {
        let h = FileHeader {
            magic: crate::MAGIC_LE,
            nscns: 3,
            timdat: 0,
            symptr: 0x1234,
            nsyms: 7,
            opthdr: 0,
            flags: crate::F_LNNO,
        };
        let bytes = h.emit(Endian::Little);
        let (back, endian) = FileHeader::parse(&bytes).unwrap();
        assert_eq!(endian, Endian::Little);
        assert_eq!(back.nscns, 3);
        assert_eq!(back.symptr, 0x1234);
        assert_eq!(back.nsyms, 7);
    }

    #[test]
    fn big_endian_magic_detected() {
        let h = FileHeader {
            magic: crate::MAGIC_BE,
            ..Default::default()
        };
        let bytes = h.emit(Endian::Big);
        let (_, endian) = FileHeader::parse(&bytes).unwrap();
        assert_eq!(endian, Endian::Big);
    }

    #[test]
    fn long_section_name_reference() {
        let hdr = SectionHeader {
            name: ".a.very.long.section.name".into(),
            size: 16,
            ..Default::default()
        };
        let bytes = hdr.emit(Endian::Little, Some(4));
        assert_eq!(&bytes[0..2], b"/4");

        // Build a string table holding the name at offset 4.
        let mut strings = Vec::new();
        strings.extend_from_slice(b".a.very.long.section.name\0");
        let back = SectionHeader::parse(&bytes, Endian::Little, &strings).unwrap();
        assert_eq!(back.name, ".a.very.long.section.name");
        assert_eq!(back.size, 16);
    }

    #[test]
    fn symbol_round_trip_short_and_long() {
        let s = Syment {
            name: "short".into(),
            value: 0x40,
            scnum: 1,
            ty: 0,
            sclass: crate::C_EXT,
            numaux: 0,
        };
        let bytes = s.emit(Endian::Little, None);
        let back = Syment::parse(&bytes, Endian::Little, &[]).unwrap();
        assert_eq!(back.name, "short");
        assert_eq!(back.value, 0x40);
        assert_eq!(back.scnum, 1);

        let long = Syment {
            name: "a_name_longer_than_eight".into(),
            ..s
        };
        let bytes = long.emit(Endian::Little, Some(4));
        let strings = b"a_name_longer_than_eight\0".to_vec();
        let back = Syment::parse(&bytes, Endian::Little, &strings).unwrap();
        assert_eq!(back.name, "a_name_longer_than_eight");
    }

    #[test]
    fn reloc_round_trip() {
        let r = Reloc {
            vaddr: 0x10,
            symndx: 5,
            rtype: R_DIR32,
        };
        let bytes = r.emit(Endian::Big);
        assert_eq!(Reloc::parse(&bytes, Endian::Big).unwrap(), r);
    }

    #[test]
    fn function_aux_round_trip() {
        let aux = AuxEntry::Function {
            tagndx: 1,
            fsize: 0x20,
            lnnoptr: 0x300,
            endndx: 9,
        };
        let bytes = aux.emit(Endian::Little, None);
        let back = AuxEntry::parse(&bytes, Endian::Little, crate::C_FCN, 0, &[]).unwrap();
        assert_eq!(back, aux);
    }
}
