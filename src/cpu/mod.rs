//! Initial vCPU register state for HVM guests.
//!
//! The register file layout depends on the word size of the toolstack, so
//! each architecture gets its own context type. [`VcpuGuestContext`] names
//! the one matching the build target.

mod x86_32;
mod x86_64;

pub use x86_32::{UserRegs32, X86_32Context};
pub use x86_64::{UserRegs64, X86_64Context};

use std::fmt;

/// Number of entries in the virtual trap table.
pub const NR_TRAPS: usize = 256;

/// Context flag marking a hardware-virtualized guest.
pub const VGCF_HVM_GUEST: u32 = 1 << 1;

/// One virtual trap table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapInfo {
    pub vector: u8,
    pub flags: u8,
    pub cs: u16,
    pub address: u64,
}

/// Identity trap table: entry `i` handles vector `i` through `cs`.
pub fn hvm_trap_table(cs: u16) -> [TrapInfo; NR_TRAPS] {
    std::array::from_fn(|i| TrapInfo {
        vector: i as u8,
        flags: 0,
        cs,
        address: 0,
    })
}

/// Architecture-specific vCPU context.
pub trait CpuContext: Clone + fmt::Debug {
    /// Architecture name, as printed in diagnostics.
    const ARCH: &'static str;

    /// Flat ring-0 code selector of the toolstack's word size.
    const FLAT_KERNEL_CS: u16;

    /// Context for vCPU 0 of an HVM guest starting at `entry`.
    ///
    /// Everything not listed is zero: no LDT or GDT, no debug registers,
    /// no callbacks.
    fn new_hvm(entry: u64) -> Self;

    /// Instruction pointer the vCPU starts at.
    fn entry(&self) -> u64;

    fn flags(&self) -> u32;
}

/// Context type of the build target.
#[cfg(target_pointer_width = "64")]
pub type VcpuGuestContext = X86_64Context;

/// Context type of the build target.
#[cfg(not(target_pointer_width = "64"))]
pub type VcpuGuestContext = X86_32Context;
