//! Interrupt dispatch.
//!
//! The low-level vector stubs (part of the out-of-tree boot assembly)
//! save registers and call [`dispatch`] with their vector number; this
//! module fans out to the registered Rust handlers. Handlers run with
//! interrupts disabled and must not take locks the interrupted context
//! may hold.

use core::sync::atomic::{AtomicPtr, Ordering};

use kaon_core::kwarn;

/// A registered interrupt handler.
pub type IrqHandler = fn(vector: u8);

const VECTORS: usize = 256;

static HANDLERS: [AtomicPtr<()>; VECTORS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; VECTORS];

unsafe extern "C" {
    /// Table of per-vector stub entry addresses, emitted by the boot
    /// assembly. Entry `n` pushes `n` and jumps to the common stub
    /// that calls [`dispatch`].
    static __vector_stub_table: [u32; VECTORS];
}

/// Registers `handler` for `vector`, replacing any previous handler.
pub fn register_handler(vector: u8, handler: IrqHandler) {
    HANDLERS[vector as usize].store(handler as *mut (), Ordering::Release);
}

/// Installs every stub into a CPU's IDT.
pub fn install_stubs(idt: &mut crate::arch::x86::idt::Idt) {
    // SAFETY: the stub table is a linker-provided array of valid code
    // addresses.
    let stubs = unsafe { &__vector_stub_table };
    for (vector, &stub) in stubs.iter().enumerate() {
        #[expect(clippy::cast_possible_truncation, reason = "vector < 256")]
        idt.set_gate(vector as u8, stub);
    }
}

/// The common entry from the vector stubs.
///
/// Unknown vectors are logged once per occurrence and otherwise
/// ignored; the local APIC still needs its EOI, which the stub issues
/// after this returns.
#[unsafe(no_mangle)]
pub extern "C" fn dispatch(vector: u8) {
    let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
    if raw.is_null() {
        kwarn!("unhandled interrupt vector {vector}");
        return;
    }
    // SAFETY: only valid `IrqHandler` pointers are stored in HANDLERS.
    let handler: IrqHandler = unsafe { core::mem::transmute(raw) };
    handler(vector);
}
