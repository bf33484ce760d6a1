//! Name interning and the output string table.
//!
//! Symbol names are interned once and referenced by [`NameId`] everywhere
//! else, so name equality is an integer compare. The [`StringTable`] is the
//! output-side structure shared by long symbol names and long section names:
//! a 4-byte little-endian total length (which includes the length field
//! itself) followed by NUL-terminated strings.

use hashbrown::HashMap;

use ferrite_entity::{entity_impl, PrimaryMap};

/// An interned string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(u32);
entity_impl!(NameId, "name");

/// Owner of canonical name storage.
#[derive(Debug, Default)]
pub struct Interner {
    strings: PrimaryMap<NameId, String>,
    lookup: HashMap<String, NameId>,
}

impl Interner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the canonical id.
    pub fn intern(&mut self, s: &str) -> NameId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), id);
        id
    }

    /// Look up an already-interned string.
    pub fn get(&self, s: &str) -> Option<NameId> {
        self.lookup.get(s).copied()
    }

    /// Resolve an id back to its text.
    pub fn resolve(&self, id: NameId) -> &str {
        &self.strings[id]
    }
}

/// Number of bytes occupied by the string-table length field.
pub const STRING_SIZE_SIZE: u32 = 4;

/// The object-file string table.
///
/// Offsets handed out by [`StringTable::add`] already include the length
/// field, so they can be stored directly in symbol and section records.
#[derive(Debug)]
pub struct StringTable {
    data: Vec<u8>,
    lookup: HashMap<String, u32>,
}

impl StringTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Add `s`, deduplicating, and return its offset (length field
    /// included).
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.lookup.get(s) {
            return off;
        }
        let off = STRING_SIZE_SIZE + self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.lookup.insert(s.to_string(), off);
        off
    }

    /// Add `s` without deduplication. Long section names use this: the
    /// section header stores a decimal rendering of the offset, and sharing
    /// would tie header contents to symbol-table history.
    pub fn add_no_hash(&mut self, s: &str) -> u32 {
        let off = STRING_SIZE_SIZE + self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        off
    }

    /// Total size of the emitted table, length field included.
    pub fn size(&self) -> u32 {
        STRING_SIZE_SIZE + self.data.len() as u32
    }

    /// True if no strings were added.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serialize: 4-byte little-endian total length, then the strings.
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Fetch the NUL-terminated string at `offset` (length field included),
    /// as the reader side needs.
    pub fn get(&self, offset: u32) -> Option<&str> {
        let start = offset.checked_sub(STRING_SIZE_SIZE)? as usize;
        let tail = self.data.get(start..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_canonical() {
        let mut i = Interner::new();
        let a = i.intern("foo");
        let b = i.intern("foo");
        let c = i.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(i.resolve(a), "foo");
    }

    #[test]
    fn strtab_layout() {
        let mut t = StringTable::new();
        let a = t.add("alpha");
        let b = t.add("beta");
        assert_eq!(a, 4);
        assert_eq!(b, 4 + 6);
        assert_eq!(t.add("alpha"), a);

        let bytes = t.emit();
        // Length field counts itself.
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(len as usize, bytes.len());
        assert_eq!(&bytes[4..9], b"alpha");
        assert_eq!(bytes[9], 0);
        assert_eq!(t.get(b), Some("beta"));
    }
}
