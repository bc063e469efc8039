//! Guest physical memory layout.
//!
//! This module computes the guest's physical address space: the page
//! array handed to the hypervisor, the MMIO window below 4 GiB, and the
//! reserved control pages at the top of low memory.

mod e820;
mod guest;
mod populate;

pub use e820::{E820Entry, E820Type, FirmwareMemoryMap};
pub use guest::{GuestWriter, MemoryWriter};
pub(crate) use guest::with_frame;
pub use populate::populate;

use crate::error::{Error, Result};
use crate::loader::elf::SetupInfo;

/// Guest physical frame number.
pub type Pfn = u64;
/// Machine frame number.
pub type Mfn = u64;

/// Standard memory layout for HVM guests.
pub mod layout {
    pub const PAGE_SHIFT: u32 = 12;
    pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

    /// Legacy VGA memory hole, never backed by RAM.
    pub const VGA_HOLE_START: u64 = 0xA0000;
    pub const VGA_HOLE_END: u64 = 0xC0000;
    pub const VGA_HOLE_START_PFN: u64 = VGA_HOLE_START >> PAGE_SHIFT;
    pub const VGA_HOLE_END_PFN: u64 = VGA_HOLE_END >> PAGE_SHIFT;

    /// Start of the firmware-reserved region below 1 MiB.
    pub const LOW_RESERVED_START: u64 = 0x9F000;

    /// Second-stage firmware loader entry point.
    pub const HVM_LOADER_ENTRY: u64 = 0x0010_0000;

    /// High memory (above the legacy region) starts at 1 MiB.
    pub const HIGH_MEMORY_START: u64 = 0x0010_0000;

    /// RAM ends here below 4 GiB; the rest is the PCI MMIO window.
    pub const BELOW_4G_RAM_END: u64 = 0xF000_0000;
    pub const BELOW_4G_MMIO_START: u64 = BELOW_4G_RAM_END;
    pub const BELOW_4G_MMIO_LENGTH: u64 = (1 << 32) - BELOW_4G_MMIO_START;

    /// RAM relocated out of the MMIO window resumes at 4 GiB.
    pub const FOUR_GB: u64 = 1 << 32;

    /// Boot-info table location.
    pub const HVM_INFO_PFN: u64 = 0x09F;
    pub const HVM_INFO_OFFSET: usize = 0x800;

    /// Legacy memory map page and offsets inside it.
    pub const E820_MAP_PAGE: u64 = 0x0009_0000;
    pub const E820_MAP_NR_OFFSET: usize = 0x1E8;
    pub const E820_MAP_OFFSET: usize = 0x2D0;

    /// Number of control pages reserved at the top of low memory
    /// (I/O request, store, buffered I/O request).
    pub const NR_RESERVED_PAGES: u64 = 3;
}

use layout::*;

/// Fixed facts about a guest of a given memory size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    mem_size: u64,
}

impl MemoryLayout {
    /// Smallest guest that can hold the fixed low map and the reserved pages.
    pub const MIN_MEMORY_SIZE: u64 = HIGH_MEMORY_START + NR_RESERVED_PAGES * PAGE_SIZE;

    /// Describe a guest with `memory_mb` megabytes of RAM.
    pub fn new(memory_mb: u32) -> Result<Self> {
        let mem_size = u64::from(memory_mb) << 20;
        if mem_size <= Self::MIN_MEMORY_SIZE {
            return Err(Error::InvalidMemorySize(memory_mb));
        }
        Ok(Self { mem_size })
    }

    /// Guest RAM in bytes.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    /// Number of guest frames.
    pub fn nr_pages(&self) -> u64 {
        self.mem_size >> PAGE_SHIFT
    }

    /// End of RAM below the MMIO window.
    pub fn low_mem_end(&self) -> u64 {
        self.mem_size.min(BELOW_4G_RAM_END)
    }

    /// RAM relocated above 4 GiB.
    pub fn high_mem_size(&self) -> u64 {
        self.mem_size.saturating_sub(BELOW_4G_RAM_END)
    }

    /// Frame holding the I/O request page (top of low memory).
    pub fn ioreq_pfn(&self) -> Pfn {
        (self.low_mem_end() >> PAGE_SHIFT) - 1
    }

    /// Frame holding the store page.
    pub fn store_pfn(&self) -> Pfn {
        self.ioreq_pfn() - 1
    }

    /// Frame holding the buffered I/O request page.
    pub fn bufioreq_pfn(&self) -> Pfn {
        self.ioreq_pfn() - 2
    }

    /// All reserved control frames, highest first.
    pub fn reserved_pfns(&self) -> [Pfn; NR_RESERVED_PAGES as usize] {
        [self.ioreq_pfn(), self.store_pfn(), self.bufioreq_pfn()]
    }
}

/// Guest frame table, indexed by guest pfn.
///
/// Holds guest frame numbers until [`PageArray::translate`] is called and
/// machine frame numbers afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArray {
    frames: Vec<u64>,
    translated: bool,
}

impl PageArray {
    /// Build the identity table for `nr_pages` frames, moving every frame
    /// at or above the below-4GiB RAM ceiling past the MMIO window.
    pub fn new(nr_pages: u64) -> Self {
        let first_shifted = BELOW_4G_RAM_END >> PAGE_SHIFT;
        let shift = BELOW_4G_MMIO_LENGTH >> PAGE_SHIFT;
        let frames = (0..nr_pages)
            .map(|pfn| if pfn >= first_shifted { pfn + shift } else { pfn })
            .collect();
        Self {
            frames,
            translated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.frames
    }

    /// Entry for guest frame `pfn`.
    pub fn get(&self, pfn: Pfn) -> Option<u64> {
        usize::try_from(pfn)
            .ok()
            .and_then(|idx| self.frames.get(idx))
            .copied()
    }

    /// Whether the entries hold machine frame numbers.
    pub fn is_translated(&self) -> bool {
        self.translated
    }

    /// Slots `start..end`, clamped to the array length.
    pub(crate) fn range(&self, start: usize, end: usize) -> &[u64] {
        let end = end.min(self.frames.len());
        let start = start.min(end);
        &self.frames[start..end]
    }

    /// Replace every entry with its machine frame via `translate`.
    pub(crate) fn translate<E>(
        &mut self,
        translate: impl FnOnce(&mut [u64]) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        translate(&mut self.frames)?;
        self.translated = true;
        Ok(())
    }
}

/// Compute the layout and page array for a validated image.
///
/// Rejects images whose loadable span does not fit in the requested memory.
pub fn plan(memory_mb: u32, setup: &SetupInfo) -> Result<(MemoryLayout, PageArray)> {
    let layout = MemoryLayout::new(memory_mb)?;

    let required = setup.kernel_end - setup.load_base;
    if required > layout.mem_size() {
        return Err(Error::ImageTooLarge {
            required,
            limit: layout.mem_size(),
        });
    }

    tracing::info!(
        "loaded HVM loader: {:#018x}->{:#018x}, total: {:#018x}->{:#018x}, entry: {:#018x}",
        setup.kernel_start,
        setup.kernel_end,
        setup.load_base,
        layout.mem_size(),
        setup.entry_point,
    );

    Ok((layout, PageArray::new(layout.nr_pages())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(kernel_end: u64) -> SetupInfo {
        SetupInfo {
            kernel_start: HVM_LOADER_ENTRY,
            kernel_end,
            load_base: 0,
            entry_point: HVM_LOADER_ENTRY,
            end_of_image: kernel_end,
        }
    }

    #[test]
    fn test_identity_below_ceiling() {
        let pages = PageArray::new(16384);
        assert_eq!(pages.len(), 16384);
        assert!(pages.as_slice().iter().enumerate().all(|(i, &f)| f == i as u64));
        assert!(!pages.is_translated());
    }

    #[test]
    fn test_mmio_shift_above_ceiling() {
        // 4 GiB + 256 MiB of RAM
        let nr_pages = (0x1_1000_0000u64) >> PAGE_SHIFT;
        let pages = PageArray::new(nr_pages);
        let ceiling = BELOW_4G_RAM_END >> PAGE_SHIFT;
        let shift = BELOW_4G_MMIO_LENGTH >> PAGE_SHIFT;

        assert_eq!(pages.get(ceiling - 1), Some(ceiling - 1));
        assert_eq!(pages.get(ceiling), Some(ceiling + shift));
        assert_eq!(pages.get(ceiling), Some(FOUR_GB >> PAGE_SHIFT));
        for (pfn, &frame) in pages.as_slice().iter().enumerate() {
            let pfn = pfn as u64;
            if pfn >= ceiling {
                assert_eq!(frame, pfn + shift);
            } else {
                assert_eq!(frame, pfn);
            }
        }
    }

    #[test]
    fn test_reserved_pages_small_guest() {
        let layout = MemoryLayout::new(64).unwrap();
        assert_eq!(layout.nr_pages(), 0x4000);
        assert_eq!(layout.ioreq_pfn(), 0x3fff);
        assert_eq!(layout.store_pfn(), 0x3ffe);
        assert_eq!(layout.bufioreq_pfn(), 0x3ffd);
        assert_eq!(layout.high_mem_size(), 0);
    }

    #[test]
    fn test_reserved_pages_large_guest() {
        let layout = MemoryLayout::new(4096).unwrap();
        assert_eq!(layout.low_mem_end(), BELOW_4G_RAM_END);
        assert_eq!(layout.ioreq_pfn(), (BELOW_4G_RAM_END >> PAGE_SHIFT) - 1);
        assert_eq!(layout.high_mem_size(), (4096u64 << 20) - BELOW_4G_RAM_END);
    }

    #[test]
    fn test_too_small_memory() {
        assert!(matches!(
            MemoryLayout::new(0),
            Err(Error::InvalidMemorySize(0))
        ));
        assert!(matches!(
            MemoryLayout::new(1),
            Err(Error::InvalidMemorySize(1))
        ));
        assert!(MemoryLayout::new(2).is_ok());
    }

    #[test]
    fn test_plan_rejects_oversized_image() {
        let err = plan(2, &setup(3 << 20)).unwrap_err();
        assert!(matches!(
            err,
            Error::ImageTooLarge {
                required,
                limit
            } if required == 3 << 20 && limit == 2 << 20
        ));
    }

    #[test]
    fn test_plan_accepts_exact_fit() {
        let (layout, pages) = plan(64, &setup(64 << 20)).unwrap();
        assert_eq!(layout.mem_size(), 64 << 20);
        assert_eq!(pages.len(), 0x4000);
    }

    #[test]
    fn test_range_clamps() {
        let pages = PageArray::new(0xb0);
        assert_eq!(pages.range(0xa0, 0xc0).len(), 0x10);
        assert!(pages.range(0xc0, 0xd0).is_empty());
    }
}
