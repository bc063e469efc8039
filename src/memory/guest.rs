//! Scoped access to guest physical memory.
//!
//! Guest frames are never mapped for longer than one copy or fill: each
//! page is mapped, touched and unmapped before the next one is visited.

use crate::backend::{DomId, Hypervisor};
use crate::error::{Error, Result};
use crate::memory::layout::{PAGE_SHIFT, PAGE_SIZE};
use crate::memory::{Mfn, PageArray, Pfn};

/// Trait for writing to guest memory.
pub trait MemoryWriter {
    /// Copy `data` to guest physical address `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes starting at guest physical address `addr`.
    fn zero(&mut self, addr: u64, len: u64) -> Result<()>;
}

/// Writes to a domain's memory through a translated [`PageArray`].
pub struct GuestWriter<'a, H: Hypervisor> {
    hv: &'a mut H,
    domid: DomId,
    pages: &'a PageArray,
}

impl<'a, H: Hypervisor> GuestWriter<'a, H> {
    pub fn new(hv: &'a mut H, domid: DomId, pages: &'a PageArray) -> Self {
        debug_assert!(pages.is_translated());
        Self { hv, domid, pages }
    }

    fn mfn(&self, pfn: Pfn) -> Result<Mfn> {
        self.pages
            .get(pfn)
            .ok_or(Error::InvalidGuestAddress(pfn << PAGE_SHIFT))
    }

    /// Map guest frame `pfn`, run `f` over its contents, unmap.
    pub fn with_page<R>(&mut self, pfn: Pfn, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mfn = self.mfn(pfn)?;
        with_frame(self.hv, self.domid, mfn, f)
    }

    /// Zero the whole of guest frame `pfn`.
    pub fn clear_page(&mut self, pfn: Pfn) -> Result<()> {
        self.with_page(pfn, |page| page.fill(0))
    }

    /// Visit `[addr, addr + len)` one page-bounded chunk at a time.
    fn for_each_chunk(
        &mut self,
        addr: u64,
        len: u64,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        let end = addr
            .checked_add(len)
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let mut done = 0u64;
        while done < len {
            let pa = addr + done;
            let offset = pa & (PAGE_SIZE - 1);
            let chunk = (end - pa).min(PAGE_SIZE - offset);
            let range = offset as usize..(offset + chunk) as usize;
            let consumed = done as usize;
            self.with_page(pa >> PAGE_SHIFT, |page| f(&mut page[range], consumed))?;
            done += chunk;
        }
        Ok(())
    }
}

impl<H: Hypervisor> MemoryWriter for GuestWriter<'_, H> {
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.for_each_chunk(addr, data.len() as u64, |dst, consumed| {
            dst.copy_from_slice(&data[consumed..consumed + dst.len()]);
        })
    }

    fn zero(&mut self, addr: u64, len: u64) -> Result<()> {
        self.for_each_chunk(addr, len, |dst, _| dst.fill(0))
    }
}

/// Map machine frame `mfn`, run `f` over its contents, unmap.
pub(crate) fn with_frame<H: Hypervisor, R>(
    hv: &mut H,
    domid: DomId,
    mfn: Mfn,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R> {
    let mut page = hv
        .map_foreign_page(domid, mfn)
        .map_err(Error::map_frame(mfn))?;
    Ok(f(&mut page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimHypervisor;

    fn populated(nr_pages: u64) -> (SimHypervisor, PageArray) {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        let mut pages = PageArray::new(nr_pages);
        hv.populate_physmap(1, pages.as_slice()).unwrap();
        pages.translate(|f| hv.translate_gpfn_list(1, f)).unwrap();
        (hv, pages)
    }

    #[test]
    fn test_write_straddles_page_boundary() {
        let (mut hv, pages) = populated(4);
        let data: Vec<u8> = (0..32u8).collect();
        GuestWriter::new(&mut hv, 1, &pages)
            .write(PAGE_SIZE - 16, &data)
            .unwrap();

        assert_eq!(hv.read_guest(1, PAGE_SIZE - 16, 32), data);
        assert_eq!(hv.map_count(), 2);
        assert_eq!(hv.live_mappings(), 0);
    }

    #[test]
    fn test_zero_clears_bytes() {
        let (mut hv, pages) = populated(4);
        let mut writer = GuestWriter::new(&mut hv, 1, &pages);
        writer.write(0x100, &[0xaa; 0x2000]).unwrap();
        writer.zero(0x200, 0x1000).unwrap();

        let bytes = hv.read_guest(1, 0x100, 0x2000);
        assert!(bytes[..0x100].iter().all(|&b| b == 0xaa));
        assert!(bytes[0x100..0x1100].iter().all(|&b| b == 0));
        assert!(bytes[0x1100..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_out_of_range_address() {
        let (mut hv, pages) = populated(2);
        let err = GuestWriter::new(&mut hv, 1, &pages)
            .write(2 * PAGE_SIZE, &[1])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGuestAddress(a) if a == 2 * PAGE_SIZE));
    }
}
