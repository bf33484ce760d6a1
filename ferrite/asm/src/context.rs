//! The assembler context.
//!
//! Classic one-pass assemblers keep the current segment, the open frag, the
//! symbol table root, and the input pointer in process globals. Here all of
//! that state lives in one [`Assembler`] value that the pipeline stages take
//! by `&mut`, so the data flow between parse, relax, and write is explicit.

use crate::diag::Diagnostics;
use crate::fixup::Fixup;
use crate::frag::{Frag, FragId, FragKind, Subseg, SubsegId};
use crate::fx::FxHashMap;
use crate::intern::{Interner, NameId};
use crate::read::{CondFrame, MacroDef};
use crate::section::{Section, SectionFlags, SectionId};
use crate::source::{SourceLoc, SourceStack};
use crate::symbol::{Segment, SymbolId, SymbolTable};
use ferrite_entity::PrimaryMap;

use crate::fixup::FixupId;

/// Target byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// Options the assembler core respects. The CLI layer fills this in from
/// the command line; embedders can construct it directly.
#[derive(Debug, Clone)]
pub struct AsmOptions {
    /// `-K PIC`: position-independent output; permits the difference of an
    /// undefined symbol in fixups and marks the format flag.
    pub pic: bool,
    /// `-m<cpu>` feature bits, a union of opcode-table flags.
    pub cpu_flags: u32,
    /// `-mregnames` / `-mno-regnames`: symbolic register parsing.
    pub regnames: bool,
    /// `-mlittle` / `-mbig`; `None` means the target default.
    pub endian: Option<Endian>,
    /// `-mrelocatable` format flag.
    pub relocatable: bool,
    /// `-mrelocatable-lib` format flag.
    pub relocatable_lib: bool,
    /// `-memb` format flag.
    pub emb: bool,
    /// MRI compatibility dialect.
    pub mri: bool,
    /// `-Z`: write the output file even after errors.
    pub always_emit: bool,
    /// Tolerate signed overflow in 16-bit data (suppresses the `.word`
    /// range warning).
    pub signed_overflow_ok: bool,
    /// Search path for `.include`.
    pub include_paths: Vec<std::path::PathBuf>,
    /// `--defsym SYM=VAL` pre-defined absolute symbols.
    pub defsyms: Vec<(String, i64)>,
    /// Enable `$n$` dollar-style local labels.
    pub dollar_labels: bool,
}

impl Default for AsmOptions {
    fn default() -> Self {
        Self {
            pic: false,
            cpu_flags: 0,
            regnames: true,
            endian: None,
            relocatable: false,
            relocatable_lib: false,
            emb: false,
            mri: false,
            always_emit: false,
            signed_overflow_ok: false,
            include_paths: Vec::new(),
            defsyms: Vec::new(),
            dollar_labels: false,
        }
    }
}

/// All assembler state: tables, the open frag, parse-time stacks.
pub struct Assembler {
    /// Configuration.
    pub opts: AsmOptions,
    /// Diagnostics sink.
    pub diag: Diagnostics,
    /// Input buffers and position tracking.
    pub sources: SourceStack,
    /// Interned names.
    pub names: Interner,
    /// The symbol table.
    pub symbols: SymbolTable,
    /// All frags, across every section.
    pub frags: PrimaryMap<FragId, Frag>,
    /// All subsegment chains.
    pub subsegs: PrimaryMap<SubsegId, Subseg>,
    /// All sections.
    pub sections: PrimaryMap<SectionId, Section>,
    /// All fixups.
    pub fixups: PrimaryMap<FixupId, Fixup>,

    /// The standard sections, created up front.
    pub text: SectionId,
    /// `.data`.
    pub data: SectionId,
    /// `.bss`.
    pub bss: SectionId,

    /// Segment currently being assembled into.
    pub now_seg: Segment,
    /// The open subsegment chain; `None` while in the absolute section.
    pub now_subseg: Option<SubsegId>,
    /// Location counter for the absolute section.
    pub abs_offset: i64,
    /// Set once subsegment chains have been concatenated; from then on new
    /// fixups attach to sections rather than subsegments.
    pub frags_chained: bool,

    /// Conditional-assembly stack (`.if`/`.else`/`.endif`).
    pub conds: Vec<CondFrame>,
    /// Defined macros, by lower-cased name.
    pub macros: FxHashMap<String, MacroDef>,
    /// The open MRI common block, if any.
    pub mri_common: Option<SymbolId>,
}

impl Assembler {
    /// Create a fresh context with the standard sections.
    pub fn new(opts: AsmOptions) -> Self {
        let mut asm = Self {
            opts,
            diag: Diagnostics::new(),
            sources: SourceStack::new(),
            names: Interner::new(),
            symbols: SymbolTable::new(),
            frags: PrimaryMap::new(),
            subsegs: PrimaryMap::new(),
            sections: PrimaryMap::new(),
            fixups: PrimaryMap::new(),
            text: SectionId::from_u32(0),
            data: SectionId::from_u32(0),
            bss: SectionId::from_u32(0),
            now_seg: Segment::Absolute,
            now_subseg: None,
            abs_offset: 0,
            frags_chained: false,
            conds: Vec::new(),
            macros: FxHashMap::default(),
            mri_common: None,
        };

        asm.text = asm.new_section(
            ".text",
            SectionFlags::ALLOC
                | SectionFlags::LOAD
                | SectionFlags::CODE
                | SectionFlags::READONLY
                | SectionFlags::HAS_CONTENTS,
        );
        asm.data = asm.new_section(
            ".data",
            SectionFlags::ALLOC | SectionFlags::LOAD | SectionFlags::DATA | SectionFlags::HAS_CONTENTS,
        );
        asm.bss = asm.new_section(".bss", SectionFlags::ALLOC | SectionFlags::BSS);

        let defsyms = asm.opts.defsyms.clone();
        for (name, value) in defsyms {
            let id = asm.symbol_find_or_make(&name);
            let sym = &mut asm.symbols.syms[id];
            sym.segment = Segment::Absolute;
            sym.value = crate::expr::Expr::constant(value);
        }

        asm.subseg_set(asm.text, 0);
        asm
    }

    /// Report an error at the current input position.
    pub fn error(&mut self, message: impl Into<String>) {
        let loc = self.sources.here();
        self.diag.error(loc, message);
    }

    /// Report a warning at the current input position.
    pub fn warn(&mut self, message: impl Into<String>) {
        let loc = self.sources.here();
        self.diag.warn(loc, message);
    }

    /// The current input location.
    pub fn here(&self) -> SourceLoc {
        self.sources.here()
    }

    /// Intern `name` and return its id.
    pub fn name(&mut self, name: &str) -> NameId {
        self.names.intern(name)
    }

    /// Create a new section with an empty subsegment list.
    pub fn new_section(&mut self, name: &str, flags: SectionFlags) -> SectionId {
        let name = self.names.intern(name);
        self.sections.push(Section::new(name, flags))
    }

    /// Find a section by name.
    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        let id = self.names.get(name)?;
        self.sections.iter().find(|(_, s)| s.name == id).map(|(k, _)| k)
    }

    /// Switch to `(section, subseg)`, closing the current frag and opening
    /// a fresh zero-length one on the destination chain.
    pub fn subseg_set(&mut self, section: SectionId, subseg: u32) {
        let chain = self.find_or_make_subseg(section, subseg);
        self.now_seg = Segment::Section(section);
        self.now_subseg = Some(chain);
        // A fresh frag at every subseg change keeps the invariant that the
        // open frag belongs to the open chain.
        self.frag_new(0);
    }

    /// Switch to the absolute section at `offset`.
    pub fn subseg_absolute(&mut self, offset: i64) {
        self.now_seg = Segment::Absolute;
        self.now_subseg = None;
        self.abs_offset = offset;
    }

    fn find_or_make_subseg(&mut self, section: SectionId, subseg: u32) -> SubsegId {
        let existing = self.sections[section]
            .subsegs
            .iter()
            .copied()
            .find(|&id| self.subsegs[id].subseg == subseg);
        if let Some(id) = existing {
            return id;
        }

        // Seed the chain with an empty fill frag so frag_last always
        // exists.
        let frag = self.frags.push(Frag::empty(FragKind::Fill, self.sources.here()));
        let id = self.subsegs.push(Subseg {
            section,
            subseg,
            frag_root: frag,
            frag_last: frag,
            fixups: Vec::new(),
        });

        // Subsegments concatenate in subseg order.
        let list = &mut self.sections[section].subsegs;
        let at = list
            .iter()
            .position(|&other| self.subsegs[other].subseg > subseg)
            .unwrap_or(list.len());
        list.insert(at, id);
        id
    }

    /// The currently open frag. Panics in the absolute section; callers
    /// there must check `now_seg` first.
    pub fn frag_now(&self) -> FragId {
        let subseg = self.now_subseg.expect("no open frag in absolute section");
        self.subsegs[subseg].frag_last
    }

    /// Offset of the next byte within the open frag.
    pub fn frag_now_fix(&self) -> u64 {
        if self.now_seg == Segment::Absolute {
            return self.abs_offset as u64;
        }
        self.frags[self.frag_now()].fix as u64
    }

    /// The section currently being assembled into, if any.
    pub fn now_section(&self) -> Option<SectionId> {
        match self.now_seg {
            Segment::Section(s) => Some(s),
            _ => None,
        }
    }

    /// The byte order in effect.
    pub fn endian(&self) -> Endian {
        self.opts.endian.unwrap_or(Endian::Little)
    }

    /// Look up the display name of a segment, for diagnostics.
    pub fn segment_name(&self, seg: Segment) -> String {
        match seg {
            Segment::Absolute => "*ABS*".to_string(),
            Segment::Undefined => "*UND*".to_string(),
            Segment::Common => "*COM*".to_string(),
            Segment::Register => "*REG*".to_string(),
            Segment::Expression => "*EXPR*".to_string(),
            Segment::Debug => "*DEBUG*".to_string(),
            Segment::Section(s) => self.names.resolve(self.sections[s].name).to_string(),
        }
    }
}
