//! The global kernel symbol lookup.
//!
//! An open-chained hash table mapping symbol names to their absolute
//! kernel addresses and owning modules. The table holds at most one
//! definition per name system-wide; later definitions of the same name
//! are refused. A reader-writer lock serialises the many concurrent
//! lookups of relocation passes against the occasional insert burst of
//! a module load.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use kaon_core::sync::RwLock;

use crate::container::ModuleId;

/// Initial bucket count.
const BASE_CAPACITY: usize = 1024;

/// Grow when the symbol count exceeds this percentage of the buckets.
const LOAD_FACTOR_PERCENT: usize = 50;

/// Bucket-count ceiling; past this, chains simply grow.
const MAXIMUM_BUCKETS: usize = 16 * 1024;

/// One symbolic definition.
#[derive(Debug, Clone)]
pub struct SymbolicDefinition {
    /// Absolute address of the symbol.
    pub value: u32,
    /// The defining module; `None` for orphaned boot symbols.
    pub owner: Option<ModuleId>,
    /// The symbol name.
    pub name: Box<[u8]>,
}

struct Table {
    buckets: Vec<Vec<SymbolicDefinition>>,
    symbols: usize,
}

impl Table {
    fn threshold(&self) -> usize {
        self.buckets.len() * LOAD_FACTOR_PERCENT / 100
    }

    fn bucket_of(&self, name: &[u8]) -> usize {
        djb2(name) as usize % self.buckets.len()
    }

    fn find(&self, name: &[u8]) -> Option<&SymbolicDefinition> {
        self.buckets[self.bucket_of(name)]
            .iter()
            .find(|def| &*def.name == name)
    }

    /// Doubles the bucket array and redistributes every chain.
    fn grow(&mut self) {
        let new_len = (self.buckets.len() * 2).min(MAXIMUM_BUCKETS);
        if new_len == self.buckets.len() {
            return;
        }
        let old = core::mem::replace(&mut self.buckets, vec![Vec::new(); new_len]);
        for chain in old {
            for def in chain {
                let bucket = djb2(&def.name) as usize % new_len;
                self.buckets[bucket].push(def);
            }
        }
    }

    fn insert(&mut self, def: SymbolicDefinition) -> bool {
        if self.find(&def.name).is_some() {
            return false;
        }
        if self.symbols + 1 > self.threshold() {
            self.grow();
        }
        let bucket = self.bucket_of(&def.name);
        self.buckets[bucket].push(def);
        self.symbols += 1;
        true
    }
}

/// The djb2 string hash.
#[must_use]
pub fn djb2(name: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

/// The global symbol table.
pub struct SymbolLookup {
    table: RwLock<Table>,
}

impl Default for SymbolLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolLookup {
    /// Creates an empty table with the base capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                buckets: vec![Vec::new(); BASE_CAPACITY],
                symbols: 0,
            }),
        }
    }

    /// Adds a definition.
    ///
    /// Returns `false` when the name is already defined; the existing
    /// definition wins.
    pub fn add(&self, name: &[u8], value: u32, owner: Option<ModuleId>) -> bool {
        if value == 0 {
            // References (undefined symbols) are never stored.
            return false;
        }
        self.table.write().insert(SymbolicDefinition {
            value,
            owner,
            name: name.into(),
        })
    }

    /// Looks a name up, returning `(value, owner)`.
    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<(u32, Option<ModuleId>)> {
        self.table
            .read()
            .find(name)
            .map(|def| (def.value, def.owner))
    }

    /// Number of definitions stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().symbols
    }

    /// Returns `true` when no definition is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count (diagnostics and tests).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.read().buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_lookup() {
        let table = SymbolLookup::new();
        assert!(table.add(b"kaon_entry", 0xC100_1000, Some(3)));
        assert_eq!(table.lookup(b"kaon_entry"), Some((0xC100_1000, Some(3))));
        assert_eq!(table.lookup(b"missing"), None);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let table = SymbolLookup::new();
        assert!(table.add(b"dup", 0x1000, None));
        assert!(!table.add(b"dup", 0x2000, Some(1)));
        // First definition wins.
        assert_eq!(table.lookup(b"dup"), Some((0x1000, None)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn zero_valued_references_are_not_stored() {
        let table = SymbolLookup::new();
        assert!(!table.add(b"extern_ref", 0, None));
        assert_eq!(table.lookup(b"extern_ref"), None);
    }

    #[test]
    fn orphaned_symbols_carry_no_owner() {
        let table = SymbolLookup::new();
        table.add(b"boot_sym", 0xC000_0010, None);
        assert_eq!(table.lookup(b"boot_sym"), Some((0xC000_0010, None)));
    }

    #[test]
    fn grows_past_the_load_factor() {
        let table = SymbolLookup::new();
        assert_eq!(table.capacity(), BASE_CAPACITY);

        // 50 % of 1024 buckets = 512 symbols triggers the first growth.
        for i in 0..600u32 {
            let name = format!("sym_{i}");
            assert!(table.add(name.as_bytes(), 0x1000 + i, Some(0)));
        }
        assert_eq!(table.len(), 600);
        assert!(table.capacity() >= 2048);

        // Everything still resolves after redistribution.
        for i in 0..600u32 {
            let name = format!("sym_{i}");
            assert_eq!(
                table.lookup(name.as_bytes()),
                Some((0x1000 + i, Some(0))),
                "lost {name}"
            );
        }
    }

    #[test]
    fn growth_caps_at_the_maximum() {
        let table = SymbolLookup::new();
        for i in 0..10_000u32 {
            let name = format!("cap_{i}");
            table.add(name.as_bytes(), 1 + i, None);
        }
        assert!(table.capacity() <= MAXIMUM_BUCKETS);
        assert_eq!(table.len(), 10_000);
        assert_eq!(table.lookup(b"cap_9999"), Some((10_000, None)));
    }

    #[test]
    fn djb2_reference_values() {
        assert_eq!(djb2(b""), 5381);
        // djb2("a") = 5381 * 33 + 97
        assert_eq!(djb2(b"a"), 5381 * 33 + 97);
    }
}
