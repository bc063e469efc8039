//! Backing the page array with machine memory.

use crate::backend::{DomId, Hypervisor};
use crate::error::{Error, Result};
use crate::memory::layout::{VGA_HOLE_END_PFN, VGA_HOLE_START_PFN};
use crate::memory::PageArray;

/// Populate every guest frame except the VGA hole, then translate the
/// array to machine frames.
///
/// Frames below the hole and above it are populated in two batches. The
/// hole itself is then handed back explicitly, whether or not anything
/// backs it.
pub fn populate<H: Hypervisor>(hv: &mut H, domid: DomId, pages: &mut PageArray) -> Result<()> {
    let nr = pages.len();
    let hole_start = VGA_HOLE_START_PFN as usize;
    let hole_end = VGA_HOLE_END_PFN as usize;

    hv.populate_physmap(domid, pages.range(0, hole_start))
        .map_err(Error::Populate)?;
    if nr > hole_end {
        hv.populate_physmap(domid, pages.range(hole_end, nr))
            .map_err(Error::Populate)?;
    }

    if nr > hole_start {
        hv.decrease_reservation(domid, pages.range(hole_start, hole_end))
            .map_err(Error::FreeVgaHole)?;
    }

    pages
        .translate(|frames| hv.translate_gpfn_list(domid, frames))
        .map_err(Error::Translate)?;

    tracing::debug!(domid, nr_pages = nr, "populated guest memory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimHypervisor, SimOp, INVALID_MFN};

    #[test]
    fn test_vga_hole_left_unbacked() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        let mut pages = PageArray::new(0x4000);
        populate(&mut hv, 1, &mut pages).unwrap();

        assert!(pages.is_translated());
        assert_eq!(hv.populated(1), 0x4000 - 0x20);
        assert_eq!(hv.released(1), (0xa0..0xc0).collect::<Vec<u64>>());
        assert_eq!(pages.get(0xa0), Some(INVALID_MFN));
        assert_eq!(pages.get(0xbf), Some(INVALID_MFN));
        assert_eq!(pages.get(0x9f), hv.mfn_of(1, 0x9f));
        assert_eq!(pages.get(0xc0), hv.mfn_of(1, 0xc0));
        assert_eq!(
            hv.calls(),
            &[
                SimOp::PopulatePhysmap,
                SimOp::PopulatePhysmap,
                SimOp::DecreaseReservation,
                SimOp::TranslateGpfnList,
            ]
        );
    }

    #[test]
    fn test_small_guest_partial_hole() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        let mut pages = PageArray::new(0xb0);
        populate(&mut hv, 1, &mut pages).unwrap();

        assert_eq!(hv.populated(1), 0xa0);
        assert_eq!(hv.released(1).len(), 0x10);
        assert_eq!(
            hv.calls(),
            &[
                SimOp::PopulatePhysmap,
                SimOp::DecreaseReservation,
                SimOp::TranslateGpfnList,
            ]
        );
    }

    #[test]
    fn test_populate_failure() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.fail_next(SimOp::PopulatePhysmap, -12);
        let mut pages = PageArray::new(0x4000);

        let err = populate(&mut hv, 1, &mut pages).unwrap_err();
        assert!(matches!(err, Error::Populate(e) if e.rc == -12));
        assert!(!pages.is_translated());
    }

    #[test]
    fn test_translate_failure() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.fail_next(SimOp::TranslateGpfnList, -22);
        let mut pages = PageArray::new(0x400);

        let err = populate(&mut hv, 1, &mut pages).unwrap_err();
        assert!(matches!(err, Error::Translate(_)));
    }
}
