//! Per-module records and the loaded-module registry.

use alloc::string::String;
use alloc::vec::Vec;

/// Index of a module in the registry.
pub type ModuleId = u32;

/// The binary interface a module was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// ELF32 shared object, the only ABI this kernel links.
    Elf,
}

/// The record of one loaded module.
///
/// `base` and the exported symbols become immutable once the container
/// is registered; the loader's intermediate linking state is discarded
/// after the bundle finishes.
#[derive(Debug)]
pub struct ModuleContainer {
    /// Build name from the module command line.
    pub name: String,
    /// Build version from the module command line (0 when absent).
    pub version: u32,
    /// The module's ABI tag.
    pub abi: Abi,
    /// Kernel virtual base the segments were placed at.
    base: u32,
    /// Physical address the boot loader delivered the file at.
    pub load_address: u64,
    /// Entry address, absolute, if the image names one.
    pub entry: Option<u32>,
    /// `DT_INIT` address, absolute.
    pub init: Option<u32>,
    /// `DT_FINI` address, absolute; retained for shutdown.
    pub fini: Option<u32>,
    /// `DT_PREINIT_ARRAY` functors, absolute, in array order.
    pub preinit_array: Vec<u32>,
    /// `DT_INIT_ARRAY` functors, absolute, in array order.
    pub init_array: Vec<u32>,
    /// `DT_FINI_ARRAY` functors, absolute; retained for shutdown.
    pub fini_array: Vec<u32>,
}

impl ModuleContainer {
    /// Creates a record for a module placed at `base`.
    #[must_use]
    pub fn new(name: String, version: u32, base: u32, load_address: u64) -> Self {
        Self {
            name,
            version,
            abi: Abi::Elf,
            base,
            load_address,
            entry: None,
            init: None,
            fini: None,
            preinit_array: Vec::new(),
            init_array: Vec::new(),
            fini_array: Vec::new(),
        }
    }

    /// The module's virtual base address.
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The initializer addresses in invocation order: the preinit
    /// array, then `DT_INIT`, then the init array.
    #[must_use]
    pub fn init_sequence(&self) -> Vec<u32> {
        let mut sequence = Vec::with_capacity(
            self.preinit_array.len() + usize::from(self.init.is_some()) + self.init_array.len(),
        );
        sequence.extend_from_slice(&self.preinit_array);
        if let Some(init) = self.init {
            sequence.push(init);
        }
        sequence.extend_from_slice(&self.init_array);
        sequence
    }

    /// The finalizer addresses in invocation order: the fini array,
    /// then `DT_FINI` (the reverse discipline of initialisation).
    #[must_use]
    pub fn fini_sequence(&self) -> Vec<u32> {
        let mut sequence = Vec::with_capacity(self.fini_array.len() + 1);
        sequence.extend_from_slice(&self.fini_array);
        if let Some(fini) = self.fini {
            sequence.push(fini);
        }
        sequence
    }
}

/// The registry of every loaded module.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleContainer>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container, returning its permanent id.
    pub fn register(&mut self, container: ModuleContainer) -> ModuleId {
        let id = u32::try_from(self.modules.len()).expect("registry fits u32");
        self.modules.push(container);
        id
    }

    /// Borrows a module record.
    #[must_use]
    pub fn get(&self, id: ModuleId) -> &ModuleContainer {
        &self.modules[id as usize]
    }

    /// Mutably borrows a record; used only while its bundle is still
    /// loading.
    pub fn get_mut(&mut self, id: ModuleId) -> &mut ModuleContainer {
        &mut self.modules[id as usize]
    }

    /// Number of loaded modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` when no module is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Iterates over `(id, container)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleContainer)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (u32::try_from(i).expect("registry fits u32"), m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn init_sequence_order() {
        let mut c = ModuleContainer::new("m".to_string(), 1, 0xC100_0000, 0x20_0000);
        c.preinit_array = vec![1, 2];
        c.init = Some(3);
        c.init_array = vec![4, 5];
        assert_eq!(c.init_sequence(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn init_sequence_with_gaps() {
        let mut c = ModuleContainer::new("m".to_string(), 1, 0, 0);
        c.init_array = vec![9];
        assert_eq!(c.init_sequence(), vec![9]);
        assert!(c.fini_sequence().is_empty());
    }

    #[test]
    fn fini_sequence_order() {
        let mut c = ModuleContainer::new("m".to_string(), 1, 0, 0);
        c.fini = Some(7);
        c.fini_array = vec![5, 6];
        assert_eq!(c.fini_sequence(), vec![5, 6, 7]);
    }

    #[test]
    fn registry_hands_out_sequential_ids() {
        let mut registry = ModuleRegistry::new();
        let a = registry.register(ModuleContainer::new("a".to_string(), 0, 0x1000, 0));
        let b = registry.register(ModuleContainer::new("b".to_string(), 0, 0x2000, 0));
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.get(a).name, "a");
        assert_eq!(registry.get(b).base(), 0x2000);
        assert_eq!(registry.len(), 2);
    }
}
