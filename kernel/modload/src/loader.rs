//! The two-pass module bundle loader.
//!
//! Pass 1 (*globalize*) places every module of the bundle: segments are
//! copied into kernel memory with the BSS tail zeroed, the dynamic
//! segment is walked for the linking tables and init/fini functors, and
//! each dynamic definition is exported into the global symbol table
//! with the module's base added. Pass 2 (*link*) walks each module's
//! relocation tables and patches the sites; because every module was
//! globalized first, bundle-internal references resolve in either
//! direction. Boot-time failure to load a module is fatal for the
//! caller.

use alloc::string::String;
use alloc::vec::Vec;

use kaon_core::{kdebug, kinfo};
use kaon_elf::dynamic::{DynIter, DynamicInfo};
use kaon_elf::program::{ProgramHeaderIter, SegmentKind, load_extent};
use kaon_elf::symbol::SymbolTable;
use kaon_elf::{Elf32Header, ElfError};

use crate::container::{ModuleContainer, ModuleId, ModuleRegistry};
use crate::linker::{LinkStats, link_module};
use crate::symbols::SymbolLookup;

/// Largest module file the loader accepts (2 MiB).
pub const MAX_MODULE_SIZE: usize = 2 * 1024 * 1024;

/// Errors from bundle loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The image failed ELF validation.
    InvalidImage(ElfError),
    /// The file exceeds [`MAX_MODULE_SIZE`].
    TooLarge,
    /// The image has no loadable segments.
    Empty,
    /// Kernel memory for the segments could not be reserved.
    NoMemory,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidImage(e) => write!(f, "invalid module image: {e}"),
            Self::TooLarge => write!(f, "module file too large"),
            Self::Empty => write!(f, "module has no loadable segments"),
            Self::NoMemory => write!(f, "no memory for module segments"),
        }
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        Self::InvalidImage(e)
    }
}

/// Reserves mapped kernel memory for module segments.
///
/// The kernel implementation takes dynamic-region pages, backs them
/// with module-zone frames, and maps them writable; host tests hand out
/// leaked buffers.
pub trait ModuleSpace {
    /// Reserves `size` bytes (rounded up to pages by the
    /// implementation). Returns the virtual base and a pointer to the
    /// zeroed memory, which must stay valid for the kernel's lifetime.
    fn place_segments(&mut self, size: usize) -> Option<(u32, *mut u8)>;
}

/// One module file awaiting loading.
pub struct BlobRegister<'a> {
    /// The raw file bytes, already mapped readable.
    pub bytes: &'a [u8],
    /// Physical address the loader found the file at.
    pub load_address: u64,
    /// The module command line (first word: module name).
    pub cmdline: &'a str,
}

/// A module that finished pass 1 and awaits linking.
struct Staged {
    id: ModuleId,
    base: u32,
    memory: *mut u8,
    extent: usize,
    dynamic: DynamicInfo,
    /// Symbol count derived from the hash table (chain count).
    symbol_count: usize,
}

/// The bundle loader.
pub struct ModuleLoader<'k> {
    space: &'k mut dyn ModuleSpace,
    registry: &'k mut ModuleRegistry,
    symbols: &'k SymbolLookup,
    /// Address unresolved references are bound to.
    stub: u32,
}

impl<'k> ModuleLoader<'k> {
    /// Creates a loader over the kernel services it needs.
    pub fn new(
        space: &'k mut dyn ModuleSpace,
        registry: &'k mut ModuleRegistry,
        symbols: &'k SymbolLookup,
        stub: u32,
    ) -> Self {
        Self {
            space,
            registry,
            symbols,
            stub,
        }
    }

    /// Loads and links a bundle of mutually dependent modules, then
    /// registers them. Returns the module ids in bundle order.
    ///
    /// # Errors
    ///
    /// Any module failing validation or placement fails the whole
    /// bundle; at boot this is fatal.
    pub fn load_bundle(&mut self, blobs: &[BlobRegister<'_>]) -> Result<Vec<ModuleId>, LoadError> {
        // Pass 1: globalize every module before linking any.
        let mut staged = Vec::with_capacity(blobs.len());
        for blob in blobs {
            staged.push(self.globalize(blob)?);
        }

        // Pass 2: link with every definition visible.
        for module in &staged {
            let stats = self.link(module);
            kdebug!(
                "module {} linked: {} relocs, {} unresolved",
                self.registry.get(module.id).name,
                stats.processed,
                stats.unresolved,
            );
        }

        Ok(staged.into_iter().map(|s| s.id).collect())
    }

    /// Pass 1 for one module.
    fn globalize(&mut self, blob: &BlobRegister<'_>) -> Result<Staged, LoadError> {
        if blob.bytes.len() > MAX_MODULE_SIZE {
            return Err(LoadError::TooLarge);
        }
        let header = Elf32Header::parse(blob.bytes)?;

        // Total virtual extent over the load segments.
        let extent = load_extent(ProgramHeaderIter::new(blob.bytes, &header)?) as usize;
        if extent == 0 {
            return Err(LoadError::Empty);
        }

        let (base, memory) = self
            .space
            .place_segments(extent)
            .ok_or(LoadError::NoMemory)?;

        // Copy file bytes segment by segment; memory past file_size is
        // the BSS tail and stays zero.
        let mut dynamic_region: Option<(usize, usize)> = None;
        for ph in ProgramHeaderIter::new(blob.bytes, &header)? {
            match ph.kind {
                SegmentKind::Load => {
                    let src_start = ph.offset as usize;
                    let src_end = src_start + ph.file_size as usize;
                    if src_end > blob.bytes.len() {
                        return Err(LoadError::InvalidImage(ElfError::Truncated));
                    }
                    // SAFETY: the arena covers `extent` bytes and the
                    // segment's [vaddr, vaddr + file_size) lies inside
                    // the computed extent.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            blob.bytes.as_ptr().add(src_start),
                            memory.add(ph.vaddr as usize),
                            ph.file_size as usize,
                        );
                    }
                }
                SegmentKind::Dynamic => {
                    dynamic_region = Some((ph.vaddr as usize, ph.mem_size as usize));
                }
                SegmentKind::Null | SegmentKind::Other(_) => {}
            }
        }

        let (dyn_off, dyn_len) = dynamic_region.ok_or(ElfError::NoDynamicSegment)?;
        // SAFETY: the dynamic segment was copied into the arena above.
        let arena = unsafe { core::slice::from_raw_parts(memory, extent) };
        let dynamic = DynamicInfo::collect(DynIter::new(arena, dyn_off, dyn_off + dyn_len))?;

        // Symbol count: the SysV hash chain array is one entry per
        // symbol. Without a hash section the string table is assumed
        // to directly follow the symbol table (the layout our
        // toolchain emits).
        let symbol_count = if dynamic.hash != 0 {
            let off = dynamic.hash as usize + 4;
            if off + 4 <= arena.len() {
                u32::from_le_bytes(arena[off..off + 4].try_into().expect("4 bytes")) as usize
            } else {
                0
            }
        } else {
            (dynamic.strtab.saturating_sub(dynamic.symtab) / dynamic.syment.max(16)) as usize
        };

        // Register the container and export the definitions.
        let mut container = ModuleContainer::new(
            module_name(blob.cmdline),
            0,
            base,
            blob.load_address,
        );
        if header.entry != 0 {
            container.entry = Some(base + header.entry);
        }
        if dynamic.init != 0 {
            container.init = Some(base + dynamic.init);
        }
        if dynamic.fini != 0 {
            container.fini = Some(base + dynamic.fini);
        }
        container.preinit_array = functor_array(arena, base, dynamic.preinit_array);
        container.init_array = functor_array(arena, base, dynamic.init_array);
        container.fini_array = functor_array(arena, base, dynamic.fini_array);
        let id = self.registry.register(container);

        let symtab = symbol_view(arena, &dynamic, symbol_count);
        let mut exported = 0usize;
        for sym in symtab.iter() {
            if !sym.is_definition() {
                continue;
            }
            if let Some(name) = symtab.name_of(&sym) {
                if self.symbols.add(name, base + sym.value, Some(id)) {
                    exported += 1;
                }
            }
        }
        kinfo!(
            "module {} at {:#x}: {} bytes, {} symbols",
            self.registry.get(id).name,
            base,
            extent,
            exported,
        );

        Ok(Staged {
            id,
            base,
            memory,
            extent,
            dynamic,
            symbol_count,
        })
    }

    /// Pass 2 for one module: both relocation tables.
    fn link(&mut self, module: &Staged) -> LinkStats {
        // Snapshot the read-only linking tables before taking the
        // mutable view of the arena for patching: the symbol, string,
        // hash, and relocation bytes do not change during the pass.
        let (symtab_bytes, strtab_bytes, hash_bytes, rel_tables) = {
            // SAFETY: the arena was reserved for `extent` bytes in
            // pass 1 and nothing mutates it between passes.
            let arena = unsafe { core::slice::from_raw_parts(module.memory, module.extent) };

            let syment = module.dynamic.syment.max(16) as usize;
            let sym_start = module.dynamic.symtab as usize;
            let sym_end = (sym_start + module.symbol_count * syment).min(arena.len());
            let str_start = module.dynamic.strtab as usize;
            let str_end = (str_start + module.dynamic.strsz as usize).min(arena.len());

            let hash = if module.dynamic.hash != 0 {
                Some(arena[module.dynamic.hash as usize..].to_vec())
            } else {
                None
            };

            let mut rels: Vec<Vec<u8>> = Vec::new();
            for (table, size) in [
                (module.dynamic.rel, module.dynamic.relsz),
                (module.dynamic.jmprel, module.dynamic.pltrelsz),
            ] {
                if table == 0 || size == 0 {
                    continue;
                }
                let start = table as usize;
                let end = (start + size as usize).min(arena.len());
                rels.push(arena[start..end].to_vec());
            }

            (
                arena[sym_start..sym_end].to_vec(),
                arena[str_start..str_end].to_vec(),
                hash,
                rels,
            )
        };

        let symtab = SymbolTable::new(&symtab_bytes, &strtab_bytes, hash_bytes.as_deref());
        let symbols = self.symbols;
        let resolve = move |name: &[u8]| symbols.lookup(name).map(|(value, _)| value);

        // SAFETY: the shared view above ended; this is now the only
        // reference into the arena.
        let memory = unsafe { core::slice::from_raw_parts_mut(module.memory, module.extent) };

        let mut total = LinkStats::default();
        for rel_bytes in &rel_tables {
            let stats = link_module(
                memory,
                module.base,
                rel_bytes,
                &symtab,
                &resolve,
                self.stub,
            );
            total.processed += stats.processed;
            total.unresolved += stats.unresolved;
            total.unsupported += stats.unsupported;
        }
        total
    }
}

/// The module name is the first word of its command line.
fn module_name(cmdline: &str) -> String {
    let name = cmdline.split_whitespace().next().unwrap_or("unnamed");
    String::from(name)
}

/// Reads an `(address, byte_size)` functor array out of the arena,
/// rebasing each entry.
fn functor_array(arena: &[u8], base: u32, (addr, size): (u32, u32)) -> Vec<u32> {
    if addr == 0 || size == 0 {
        return Vec::new();
    }
    let start = addr as usize;
    let end = start + size as usize;
    if end > arena.len() {
        return Vec::new();
    }
    arena[start..end]
        .chunks_exact(4)
        .map(|c| base + u32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect()
}

/// Builds the module's symbol-table view from the dynamic info.
fn symbol_view<'a>(arena: &'a [u8], dynamic: &DynamicInfo, symbol_count: usize) -> SymbolTable<'a> {
    let syment = dynamic.syment.max(16) as usize;
    let sym_start = dynamic.symtab as usize;
    let sym_end = (sym_start + symbol_count * syment).min(arena.len());
    let str_start = dynamic.strtab as usize;
    let str_end = (str_start + dynamic.strsz as usize).min(arena.len());
    let hash = if dynamic.hash != 0 {
        Some(&arena[dynamic.hash as usize..])
    } else {
        None
    };
    SymbolTable::new(&arena[sym_start..sym_end], &arena[str_start..str_end], hash)
}
