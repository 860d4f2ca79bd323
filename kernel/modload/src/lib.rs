//! Kernel module loading and dynamic linking.
//!
//! Modules are relocatable ELF32 shared objects delivered by the boot
//! loader. A bundle of mutually dependent modules loads in two passes:
//! first every module is *globalized* — segments placed, BSS zeroed,
//! dynamic information captured, definitions exported into the global
//! symbol table — and only then is each module *linked*, so
//! cross-module references resolve regardless of bundle order. After
//! linking, each module's initializers run in the ELF-prescribed order
//! (preinit array, init function, init array).
//!
//! - [`symbols`] — the global symbol lookup.
//! - [`container`] — per-module records and the loaded-module registry.
//! - [`linker`] — relocation walking and site patching.
//! - [`loader`] — the two-pass bundle protocol over a [`loader::ModuleSpace`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod container;
pub mod linker;
pub mod loader;
pub mod symbols;

pub use container::{Abi, ModuleContainer, ModuleId, ModuleRegistry};
pub use linker::{LinkStats, link_module};
pub use loader::{BlobRegister, LoadError, ModuleLoader, ModuleSpace};
pub use symbols::SymbolLookup;
