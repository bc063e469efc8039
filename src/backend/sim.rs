//! In-process model of the privileged hypervisor interface.
//!
//! `SimHypervisor` keeps machine memory in host memory, allocates machine
//! frames on demand and records every call, so a full guest build can be
//! run and inspected without a hypervisor. Failures can be injected per
//! operation.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};

use super::{DomId, DomainInfo, HvResult, HvmParam, HypercallError, Hypervisor};
use crate::cpu::VcpuGuestContext;
use crate::memory::layout::{PAGE_SHIFT, PAGE_SIZE};
use crate::memory::{Mfn, Pfn};

/// Translation result for a guest frame with no backing.
pub const INVALID_MFN: Mfn = !0;

/// First machine frame handed out. Kept away from zero so translated
/// frames never coincide with guest frames.
const FIRST_MFN: Mfn = 0x80000;

const ESRCH: i32 = -3;
const EINVAL: i32 = -22;
const EEXIST: i32 = -17;
const EPERM: i32 = -1;

/// Privileged operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    DomainInfo,
    PopulatePhysmap,
    DecreaseReservation,
    TranslateGpfnList,
    MapForeignPage,
    SetHvmParam,
    SetVcpuContext,
}

impl SimOp {
    fn name(self) -> &'static str {
        match self {
            SimOp::DomainInfo => "getdomaininfo",
            SimOp::PopulatePhysmap => "populate_physmap",
            SimOp::DecreaseReservation => "decrease_reservation",
            SimOp::TranslateGpfnList => "translate_gpfn_list",
            SimOp::MapForeignPage => "map_foreign_range",
            SimOp::SetHvmParam => "set_hvm_param",
            SimOp::SetVcpuContext => "setvcpucontext",
        }
    }
}

impl fmt::Display for SimOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
struct SimDomain {
    shared_info_frame: Mfn,
    p2m: BTreeMap<Pfn, Mfn>,
    released: Vec<Pfn>,
    params: BTreeMap<HvmParam, u64>,
    vcpus: BTreeMap<u32, VcpuGuestContext>,
}

/// A mapped machine frame. Dropping it releases the mapping.
pub struct SimPage<'a> {
    bytes: &'a mut [u8],
    live: &'a Cell<usize>,
}

impl Deref for SimPage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for SimPage<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

impl Drop for SimPage<'_> {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

/// Simulated hypervisor.
#[derive(Debug)]
pub struct SimHypervisor {
    domains: BTreeMap<DomId, SimDomain>,
    /// Owner of every allocated machine frame.
    owners: HashMap<Mfn, DomId>,
    /// Host memory behind machine frames, allocated on first mapping.
    memory: HashMap<Mfn, Box<[u8]>>,
    next_mfn: Mfn,
    faults: HashMap<SimOp, i32>,
    calls: Vec<SimOp>,
    map_count: usize,
    live: Cell<usize>,
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self {
            domains: BTreeMap::new(),
            owners: HashMap::new(),
            memory: HashMap::new(),
            next_mfn: FIRST_MFN,
            faults: HashMap::new(),
            calls: Vec::new(),
            map_count: 0,
            live: Cell::new(0),
        }
    }

    /// Create an empty domain with its shared control page.
    pub fn create_domain(&mut self, domid: DomId) {
        let shared_info_frame = self.alloc_frame(domid);
        self.domains.insert(
            domid,
            SimDomain {
                shared_info_frame,
                ..Default::default()
            },
        );
    }

    /// Make the next call of `op` fail with return code `rc`.
    pub fn fail_next(&mut self, op: SimOp, rc: i32) {
        self.faults.insert(op, rc);
    }

    /// Every privileged call made so far, in order, failed ones included.
    pub fn calls(&self) -> &[SimOp] {
        &self.calls
    }

    /// Total number of frame mappings made.
    pub fn map_count(&self) -> usize {
        self.map_count
    }

    /// Mappings not yet released.
    pub fn live_mappings(&self) -> usize {
        self.live.get()
    }

    /// Machine frame backing guest frame `pfn`.
    pub fn mfn_of(&self, domid: DomId, pfn: Pfn) -> Option<Mfn> {
        self.domains.get(&domid)?.p2m.get(&pfn).copied()
    }

    /// Number of guest frames currently backed.
    pub fn populated(&self, domid: DomId) -> usize {
        self.domains.get(&domid).map_or(0, |d| d.p2m.len())
    }

    /// Guest frames handed back through `decrease_reservation`.
    pub fn released(&self, domid: DomId) -> &[Pfn] {
        self.domains
            .get(&domid)
            .map_or(&[][..], |d| d.released.as_slice())
    }

    pub fn param(&self, domid: DomId, param: HvmParam) -> Option<u64> {
        self.domains.get(&domid)?.params.get(&param).copied()
    }

    /// Installed context of `vcpu`.
    pub fn vcpu_context(&self, domid: DomId, vcpu: u32) -> Option<&VcpuGuestContext> {
        self.domains.get(&domid)?.vcpus.get(&vcpu)
    }

    /// Contents of machine frame `mfn`. Unbacked frames read as zero.
    pub fn frame(&self, mfn: Mfn) -> Vec<u8> {
        self.memory
            .get(&mfn)
            .map_or_else(|| vec![0; PAGE_SIZE as usize], |page| page.to_vec())
    }

    /// Contents of the domain's shared control page.
    pub fn shared_info(&self, domid: DomId) -> Option<Vec<u8>> {
        let domain = self.domains.get(&domid)?;
        Some(self.frame(domain.shared_info_frame))
    }

    /// Read `len` bytes of guest physical memory. Unpopulated frames read
    /// as zero.
    pub fn read_guest(&self, domid: DomId, paddr: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut pa = paddr;
        let end = paddr + len as u64;
        while pa < end {
            let offset = (pa & (PAGE_SIZE - 1)) as usize;
            let chunk = ((end - pa) as usize).min(PAGE_SIZE as usize - offset);
            match self
                .mfn_of(domid, pa >> PAGE_SHIFT)
                .and_then(|mfn| self.memory.get(&mfn))
            {
                Some(page) => out.extend_from_slice(&page[offset..offset + chunk]),
                None => out.resize(out.len() + chunk, 0),
            }
            pa += chunk as u64;
        }
        out
    }

    fn alloc_frame(&mut self, domid: DomId) -> Mfn {
        let mfn = self.next_mfn;
        self.next_mfn += 1;
        self.owners.insert(mfn, domid);
        mfn
    }

    /// Log the call and consume any fault armed for it.
    fn enter(&mut self, op: SimOp) -> HvResult<()> {
        self.calls.push(op);
        tracing::trace!(backend = "sim", %op, "hypercall");
        match self.faults.remove(&op) {
            Some(rc) => Err(HypercallError::new(op.name(), rc)),
            None => Ok(()),
        }
    }

    fn domain_mut(&mut self, op: SimOp, domid: DomId) -> HvResult<&mut SimDomain> {
        self.domains
            .get_mut(&domid)
            .ok_or(HypercallError::new(op.name(), ESRCH))
    }
}

impl Hypervisor for SimHypervisor {
    type Page<'a> = SimPage<'a>;

    fn domain_info(&mut self, domid: DomId) -> HvResult<DomainInfo> {
        self.enter(SimOp::DomainInfo)?;
        // Like the real lookup, answer with the first domain at or after
        // the requested id.
        self.domains
            .range(domid..)
            .next()
            .map(|(&domid, d)| DomainInfo {
                domid,
                shared_info_frame: d.shared_info_frame,
            })
            .ok_or(HypercallError::new(SimOp::DomainInfo.name(), ESRCH))
    }

    fn populate_physmap(&mut self, domid: DomId, pfns: &[Pfn]) -> HvResult<()> {
        let op = SimOp::PopulatePhysmap;
        self.enter(op)?;
        let domain = self.domain_mut(op, domid)?;
        if pfns.iter().any(|pfn| domain.p2m.contains_key(pfn)) {
            return Err(HypercallError::new(op.name(), EEXIST));
        }
        for &pfn in pfns {
            let mfn = self.alloc_frame(domid);
            self.domain_mut(op, domid)?.p2m.insert(pfn, mfn);
        }
        Ok(())
    }

    fn decrease_reservation(&mut self, domid: DomId, pfns: &[Pfn]) -> HvResult<()> {
        let op = SimOp::DecreaseReservation;
        self.enter(op)?;
        let domain = self.domain_mut(op, domid)?;
        let mut freed = Vec::new();
        for &pfn in pfns {
            if let Some(mfn) = domain.p2m.remove(&pfn) {
                freed.push(mfn);
            }
            domain.released.push(pfn);
        }
        for mfn in freed {
            self.owners.remove(&mfn);
            self.memory.remove(&mfn);
        }
        Ok(())
    }

    fn translate_gpfn_list(&mut self, domid: DomId, frames: &mut [u64]) -> HvResult<()> {
        let op = SimOp::TranslateGpfnList;
        self.enter(op)?;
        let domain = self.domain_mut(op, domid)?;
        for frame in frames.iter_mut() {
            *frame = domain.p2m.get(&*frame).copied().unwrap_or(INVALID_MFN);
        }
        Ok(())
    }

    fn map_foreign_page(&mut self, domid: DomId, mfn: Mfn) -> HvResult<SimPage<'_>> {
        let op = SimOp::MapForeignPage;
        self.enter(op)?;
        if !self.domains.contains_key(&domid) {
            return Err(HypercallError::new(op.name(), ESRCH));
        }
        if self.owners.get(&mfn) != Some(&domid) {
            return Err(HypercallError::new(op.name(), EPERM));
        }

        self.map_count += 1;
        self.live.set(self.live.get() + 1);
        let bytes = self
            .memory
            .entry(mfn)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        Ok(SimPage {
            bytes,
            live: &self.live,
        })
    }

    fn set_hvm_param(&mut self, domid: DomId, param: HvmParam, value: u64) -> HvResult<()> {
        let op = SimOp::SetHvmParam;
        self.enter(op)?;
        self.domain_mut(op, domid)?.params.insert(param, value);
        Ok(())
    }

    fn set_vcpu_context(
        &mut self,
        domid: DomId,
        vcpu: u32,
        ctxt: &VcpuGuestContext,
    ) -> HvResult<()> {
        let op = SimOp::SetVcpuContext;
        self.enter(op)?;
        if vcpu >= crate::shared::MAX_VIRT_CPUS {
            return Err(HypercallError::new(op.name(), EINVAL));
        }
        self.domain_mut(op, domid)?.vcpus.insert(vcpu, ctxt.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuContext;

    #[test]
    fn test_domain_lookup() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(5);

        assert_eq!(hv.domain_info(5).unwrap().domid, 5);
        // Lookup of a missing id answers for the next domain up.
        assert_eq!(hv.domain_info(2).unwrap().domid, 5);
        assert_eq!(hv.domain_info(6).unwrap_err().rc, ESRCH);
        assert_eq!(hv.calls(), &[SimOp::DomainInfo; 3]);
    }

    #[test]
    fn test_populate_translate_release() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.populate_physmap(1, &[0, 1, 2, 3]).unwrap();
        assert_eq!(hv.populated(1), 4);

        hv.decrease_reservation(1, &[2, 9]).unwrap();
        assert_eq!(hv.populated(1), 3);
        assert_eq!(hv.released(1), &[2, 9]);

        let mut frames = vec![0, 1, 2, 3];
        hv.translate_gpfn_list(1, &mut frames).unwrap();
        assert_ne!(frames[0], 0);
        assert_eq!(frames[2], INVALID_MFN);
        assert_eq!(hv.mfn_of(1, 3), Some(frames[3]));
    }

    #[test]
    fn test_double_populate_rejected() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.populate_physmap(1, &[7]).unwrap();
        assert_eq!(hv.populate_physmap(1, &[7]).unwrap_err().rc, EEXIST);
    }

    #[test]
    fn test_mapping_is_released_on_drop() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.populate_physmap(1, &[0]).unwrap();
        let mfn = hv.mfn_of(1, 0).unwrap();

        {
            let mut page = hv.map_foreign_page(1, mfn).unwrap();
            assert_eq!(page.len(), PAGE_SIZE as usize);
            page[10] = 0x42;
        }
        assert_eq!(hv.live_mappings(), 0);
        assert_eq!(hv.map_count(), 1);
        assert_eq!(hv.read_guest(1, 10, 1), vec![0x42]);
    }

    #[test]
    fn test_foreign_frame_rejected() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.create_domain(2);
        hv.populate_physmap(2, &[0]).unwrap();
        let mfn = hv.mfn_of(2, 0).unwrap();

        assert_eq!(hv.map_foreign_page(1, mfn).err().unwrap().rc, EPERM);
        assert_eq!(hv.live_mappings(), 0);
    }

    #[test]
    fn test_fault_injection_fires_once() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.fail_next(SimOp::SetHvmParam, -5);

        let err = hv.set_hvm_param(1, HvmParam::PaeEnabled, 1).unwrap_err();
        assert_eq!(err, HypercallError::new("set_hvm_param", -5));
        hv.set_hvm_param(1, HvmParam::PaeEnabled, 1).unwrap();
        assert_eq!(hv.param(1, HvmParam::PaeEnabled), Some(1));
    }

    #[test]
    fn test_vcpu_context_recorded() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        let ctxt = VcpuGuestContext::new_hvm(0x100000);
        hv.set_vcpu_context(1, 0, &ctxt).unwrap();

        assert_eq!(hv.vcpu_context(1, 0), Some(&ctxt));
        assert!(hv.vcpu_context(1, 1).is_none());
        assert_eq!(hv.set_vcpu_context(1, 32, &ctxt).unwrap_err().rc, EINVAL);
    }
}
