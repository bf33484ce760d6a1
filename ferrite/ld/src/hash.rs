//! The global link hash: one entry per external symbol name.

use crate::input::InputId;
use ferrite_coff::types::AuxEntry;
use rustc_hash::FxHashMap;

/// Where a defined symbol lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefHome {
    /// An absolute value.
    Absolute,
    /// Defined in `section` (0-based) of `input`.
    Input {
        /// Defining input file.
        input: InputId,
        /// Section index within that input.
        section: usize,
    },
    /// Defined directly in an output section (allocated commons).
    Output {
        /// Output-section index.
        section: usize,
        /// Offset within it.
        offset: u64,
    },
}

/// Resolution state of one external symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created by a lookup; nothing known yet.
    New,
    /// Referenced, not defined.
    Undefined,
    /// Weakly referenced, not defined.
    WeakUndefined,
    /// Defined.
    Defined {
        /// Where.
        home: DefHome,
        /// Value relative to the home.
        value: u64,
        /// Weak definition.
        weak: bool,
    },
    /// Declared common; a home is chosen at allocation time.
    Common {
        /// Declared size.
        size: u64,
        /// Alignment, power of two.
        align: u32,
    },
}

/// One link-hash entry.
#[derive(Debug, Clone)]
pub struct HashEntry {
    /// Symbol name.
    pub name: String,
    /// Resolution state.
    pub state: LinkState,
    /// Storage class captured from the defining input.
    pub sclass: u8,
    /// Type word.
    pub ty: u16,
    /// Number of aux records.
    pub numaux: u8,
    /// Captured aux records.
    pub aux: Vec<AuxEntry>,
    /// The input whose aux records were captured.
    pub aux_from: Option<InputId>,
    /// Output symbol index: -1 not written, -2 referenced by a written
    /// reloc and therefore reserved, >= 0 written at that index.
    pub indx: i64,
}

impl HashEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            state: LinkState::New,
            sclass: 0,
            ty: 0,
            numaux: 0,
            aux: Vec::new(),
            aux_from: None,
            indx: -1,
        }
    }

    /// Is the symbol undefined (weakly or strongly)?
    pub fn is_undefined(&self) -> bool {
        matches!(
            self.state,
            LinkState::New | LinkState::Undefined | LinkState::WeakUndefined
        )
    }
}

/// The global symbol table of the link.
#[derive(Debug, Default)]
pub struct LinkHash {
    /// Entries in insertion order; traversals use this order so output
    /// is deterministic.
    pub entries: Vec<HashEntry>,
    by_name: FxHashMap<String, usize>,
}

impl LinkHash {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name` without creating it.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Find or create the entry for `name`.
    pub fn entry(&mut self, name: &str) -> usize {
        if let Some(&i) = self.by_name.get(name) {
            return i;
        }
        let i = self.entries.len();
        self.entries.push(HashEntry::new(name.to_string()));
        self.by_name.insert(name.to_string(), i);
        i
    }

    /// Count of symbols still undefined (weak references excluded).
    pub fn undefined_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, LinkState::Undefined))
            .count()
    }
}
