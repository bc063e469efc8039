//! Named per-domain parameters read by the guest firmware.
//!
//! Every parameter is a hint. A rejected call is logged and the build
//! carries on.

use crate::backend::{DomId, HvmParam, Hypervisor};
use crate::memory::MemoryLayout;

/// Set one parameter. Returns whether the hypervisor accepted it.
pub fn set_param<H: Hypervisor>(hv: &mut H, domid: DomId, param: HvmParam, value: u64) -> bool {
    match hv.set_hvm_param(domid, param, value) {
        Ok(()) => {
            tracing::debug!(domid, %param, value, "set parameter");
            true
        }
        Err(e) => {
            tracing::warn!(domid, %param, value, error = %e, "failed to set parameter");
            false
        }
    }
}

/// Publish the PAE and APIC enablement flags.
///
/// Returns the parameters that could not be set.
pub fn publish_features<H: Hypervisor>(
    hv: &mut H,
    domid: DomId,
    pae: bool,
    apic: bool,
) -> Vec<HvmParam> {
    publish(
        hv,
        domid,
        &[
            (HvmParam::PaeEnabled, u64::from(pae)),
            (HvmParam::ApicEnabled, u64::from(apic)),
        ],
    )
}

/// Publish the reserved page frames and the store event channel.
///
/// Returns the parameters that could not be set.
pub fn publish_control_pages<H: Hypervisor>(
    hv: &mut H,
    domid: DomId,
    layout: &MemoryLayout,
    store_evtchn: u32,
) -> Vec<HvmParam> {
    publish(
        hv,
        domid,
        &[
            (HvmParam::StorePfn, layout.store_pfn()),
            (HvmParam::StoreEvtchn, u64::from(store_evtchn)),
            (HvmParam::BufioreqPfn, layout.bufioreq_pfn()),
            (HvmParam::IoreqPfn, layout.ioreq_pfn()),
        ],
    )
}

fn publish<H: Hypervisor>(hv: &mut H, domid: DomId, params: &[(HvmParam, u64)]) -> Vec<HvmParam> {
    params
        .iter()
        .filter(|&&(param, value)| !set_param(hv, domid, param, value))
        .map(|&(param, _)| param)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimHypervisor, SimOp};

    #[test]
    fn test_control_pages_published_as_pfns() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        let layout = MemoryLayout::new(64).unwrap();

        let failed = publish_control_pages(&mut hv, 1, &layout, 9);
        assert!(failed.is_empty());
        assert_eq!(hv.param(1, HvmParam::StorePfn), Some(0x3ffe));
        assert_eq!(hv.param(1, HvmParam::StoreEvtchn), Some(9));
        assert_eq!(hv.param(1, HvmParam::BufioreqPfn), Some(0x3ffd));
        assert_eq!(hv.param(1, HvmParam::IoreqPfn), Some(0x3fff));
    }

    #[test]
    fn test_failure_does_not_stop_sequence() {
        let mut hv = SimHypervisor::new();
        hv.create_domain(1);
        hv.fail_next(SimOp::SetHvmParam, -1);

        let failed = publish_features(&mut hv, 1, true, true);
        assert_eq!(failed, vec![HvmParam::PaeEnabled]);
        assert_eq!(hv.param(1, HvmParam::PaeEnabled), None);
        assert_eq!(hv.param(1, HvmParam::ApicEnabled), Some(1));
    }
}
