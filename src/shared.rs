//! Initial state of the domain's shared control page and reserved pages.

use crate::backend::{DomId, Hypervisor};
use crate::error::Result;
use crate::memory::{with_frame, GuestWriter, MemoryLayout, Mfn};

/// Virtual CPU slots in the shared page.
pub const MAX_VIRT_CPUS: u32 = 32;

const VCPU_INFO_SIZE: usize = 64;
const UPCALL_MASK_OFFSET: usize = 1;

/// Word-size dependent placement of the event-channel mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedInfoLayout {
    pub evtchn_mask_offset: usize,
    pub evtchn_mask_len: usize,
}

impl SharedInfoLayout {
    pub const X86_32: Self = Self {
        evtchn_mask_offset: 0x880,
        evtchn_mask_len: 128,
    };

    pub const X86_64: Self = Self {
        evtchn_mask_offset: 0xA00,
        evtchn_mask_len: 512,
    };

    #[cfg(target_pointer_width = "64")]
    pub const NATIVE: Self = Self::X86_64;
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE: Self = Self::X86_32;

    /// Zero `page`, mask upcalls on every vCPU and mask every event channel.
    pub fn init(&self, page: &mut [u8]) {
        page.fill(0);
        for vcpu in 0..MAX_VIRT_CPUS as usize {
            page[vcpu * VCPU_INFO_SIZE + UPCALL_MASK_OFFSET] = 1;
        }
        page[self.evtchn_mask_offset..self.evtchn_mask_offset + self.evtchn_mask_len].fill(0xff);
    }
}

/// Reset the shared control page at machine frame `shared_info_frame`.
pub fn init_shared_info<H: Hypervisor>(
    hv: &mut H,
    domid: DomId,
    shared_info_frame: Mfn,
) -> Result<()> {
    with_frame(hv, domid, shared_info_frame, |page| {
        SharedInfoLayout::NATIVE.init(page)
    })?;
    tracing::debug!(domid, frame = shared_info_frame, "initialized shared info");
    Ok(())
}

/// Zero the I/O request, store and buffered I/O request pages.
pub fn clear_reserved_pages<H: Hypervisor>(
    mem: &mut GuestWriter<'_, H>,
    layout: &MemoryLayout,
) -> Result<()> {
    for pfn in layout.reserved_pfns() {
        mem.clear_page(pfn)?;
    }
    Ok(())
}
