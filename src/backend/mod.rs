//! Hypervisor backend abstraction.
//!
//! This module defines the privileged call surface the guest builder
//! consumes. Every build stage receives the handle explicitly, so the same
//! pipeline runs against a real hypervisor interface or the in-process
//! [`sim::SimHypervisor`].

use std::fmt;
use std::ops::DerefMut;

use thiserror::Error;

use crate::cpu::VcpuGuestContext;
use crate::memory::{Mfn, Pfn};

pub mod sim;

/// Identifier of a domain managed by the hypervisor.
pub type DomId = u16;

/// A privileged call that the hypervisor rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{op} failed (rc {rc})")]
pub struct HypercallError {
    /// Name of the failed operation.
    pub op: &'static str,
    /// Return code reported by the hypervisor.
    pub rc: i32,
}

impl HypercallError {
    pub fn new(op: &'static str, rc: i32) -> Self {
        Self { op, rc }
    }
}

/// Result of a single privileged call.
pub type HvResult<T> = std::result::Result<T, HypercallError>;

/// Information returned by the domain lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    /// Domain the hypervisor answered for.
    pub domid: DomId,
    /// Machine frame of the domain's shared control page.
    pub shared_info_frame: Mfn,
}

/// Named per-domain parameters understood by the HVM guest firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HvmParam {
    StorePfn = 1,
    StoreEvtchn = 2,
    ApicEnabled = 3,
    PaeEnabled = 4,
    IoreqPfn = 5,
    BufioreqPfn = 6,
}

impl HvmParam {
    pub const ALL: [HvmParam; 6] = [
        HvmParam::StorePfn,
        HvmParam::StoreEvtchn,
        HvmParam::ApicEnabled,
        HvmParam::PaeEnabled,
        HvmParam::IoreqPfn,
        HvmParam::BufioreqPfn,
    ];

    /// Numeric index used on the wire.
    pub fn index(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for HvmParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HvmParam::StorePfn => "STORE_PFN",
            HvmParam::StoreEvtchn => "STORE_EVTCHN",
            HvmParam::ApicEnabled => "APIC_ENABLED",
            HvmParam::PaeEnabled => "PAE_ENABLED",
            HvmParam::IoreqPfn => "IOREQ_PFN",
            HvmParam::BufioreqPfn => "BUFIOREQ_PFN",
        };
        f.pad(name)
    }
}

/// Trait that all hypervisor backends must implement.
///
/// Calls are blocking and synchronous. Implementations are not required to
/// make any sequence of calls atomic; the builder never attempts rollback.
pub trait Hypervisor {
    /// A writable view of one guest frame, unmapped when dropped.
    type Page<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Look up a domain.
    fn domain_info(&mut self, domid: DomId) -> HvResult<DomainInfo>;

    /// Back each guest frame in `pfns` with a fresh machine frame.
    fn populate_physmap(&mut self, domid: DomId, pfns: &[Pfn]) -> HvResult<()>;

    /// Release the machine frames backing the guest frames in `pfns`.
    fn decrease_reservation(&mut self, domid: DomId, pfns: &[Pfn]) -> HvResult<()>;

    /// Replace every guest frame number in `frames` with its machine frame.
    fn translate_gpfn_list(&mut self, domid: DomId, frames: &mut [u64]) -> HvResult<()>;

    /// Map one machine frame of the domain into the local address space.
    fn map_foreign_page(&mut self, domid: DomId, mfn: Mfn) -> HvResult<Self::Page<'_>>;

    /// Set a named per-domain parameter.
    fn set_hvm_param(&mut self, domid: DomId, param: HvmParam, value: u64) -> HvResult<()>;

    /// Install the initial register state of a vCPU.
    fn set_vcpu_context(
        &mut self,
        domid: DomId,
        vcpu: u32,
        ctxt: &VcpuGuestContext,
    ) -> HvResult<()>;

    /// Get the backend name (e.g., "sim").
    fn name(&self) -> &'static str;
}
