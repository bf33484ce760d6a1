//! HashMap/HashSet aliases using the fast deterministic FxHasher.

pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
