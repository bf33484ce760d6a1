//! Debug-type merging for struct/union/enum tags.
//!
//! Every input that saw `struct foo { int a; int b; }` carries a full tag
//! definition. The output needs one. Definitions are keyed by tag name;
//! two are the same type iff they have the same storage class and their
//! elements match pairwise in name, type, and tag index. References to a
//! merged-away definition are redirected to the kept one's symbol index.

use rustc_hash::FxHashMap;

/// One element of a tag definition (a `C_MOS`/`C_MOE`-class symbol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeElement {
    /// Element name.
    pub name: String,
    /// Type word.
    pub ty: u16,
    /// Remapped tag index the element references, or 0.
    pub tagndx: i64,
}

/// One kept tag definition.
#[derive(Debug, Clone)]
pub struct MergeType {
    /// Storage class of the tag symbol.
    pub class: u8,
    /// Output symbol index of the kept definition.
    pub indx: i64,
    /// The elements, in order, up to the closing `C_EOS`.
    pub elements: Vec<MergeElement>,
}

/// The per-link table of kept tag definitions.
#[derive(Debug, Default)]
pub struct DebugMergeTable {
    types: FxHashMap<String, Vec<MergeType>>,
}

impl DebugMergeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an existing definition identical to `candidate` under `name`.
    pub fn find_match(&self, name: &str, candidate: &MergeType) -> Option<&MergeType> {
        self.types.get(name)?.iter().find(|t| {
            t.class == candidate.class
                && t.elements.len() == candidate.elements.len()
                && t.elements
                    .iter()
                    .zip(&candidate.elements)
                    .all(|(a, b)| a == b)
        })
    }

    /// Record `candidate` as the kept definition under `name`.
    pub fn insert(&mut self, name: &str, candidate: MergeType) {
        self.types.entry(name.to_string()).or_default().push(candidate);
    }
}

/// Compiler-invented tag names (`~`, `.`, `$` prefixed, fake labels) all
/// merge under the empty name.
pub fn canonical_tag_name(name: &str) -> &str {
    let mut chars = name.chars();
    match chars.next() {
        None => "",
        Some('~') | Some('.') | Some('$') => "",
        Some(_) => match chars.next() {
            Some('~') | Some('.') | Some('$') => "",
            _ => name,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MergeType {
        MergeType {
            class: ferrite_coff::C_STRTAG,
            indx: 10,
            elements: vec![
                MergeElement {
                    name: "a".into(),
                    ty: 4,
                    tagndx: 0,
                },
                MergeElement {
                    name: "b".into(),
                    ty: 4,
                    tagndx: 0,
                },
            ],
        }
    }

    #[test]
    fn identical_types_match() {
        let mut table = DebugMergeTable::new();
        table.insert("foo", sample());
        let found = table.find_match("foo", &sample()).expect("match");
        assert_eq!(found.indx, 10);
    }

    #[test]
    fn different_elements_do_not_match() {
        let mut table = DebugMergeTable::new();
        table.insert("foo", sample());
        let mut other = sample();
        other.elements[1].ty = 5;
        assert!(table.find_match("foo", &other).is_none());
        let mut shorter = sample();
        shorter.elements.pop();
        assert!(table.find_match("foo", &shorter).is_none());
    }

    #[test]
    fn fake_names_canonicalize() {
        assert_eq!(canonical_tag_name("~0fake"), "");
        assert_eq!(canonical_tag_name(".0fake"), "");
        assert_eq!(canonical_tag_name("_$local"), "");
        assert_eq!(canonical_tag_name("foo"), "foo");
    }
}
