//! Boot-time scan of the host device tree.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use super::{DeviceTree, FdtError, NodeRecord, RegRange};

/// Most memory banks recorded.
pub const NR_MEM_BANKS: usize = 8;
/// Boot modules besides the hypervisor itself.
pub const NR_MODULES: usize = 2;

const MODULE_CMDLINE_MAX: usize = 1024;

const GIC_COMPATIBLE: &str = "arm,cortex-a15-gic";
const MULTIBOOT_COMPATIBLE: &str = "xen,multiboot-module";
const KERNEL_MODULE: &str = "xen,linux-zimage";
const INITRD_MODULE: &str = "xen,linux-initrd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemBank {
    pub start: u64,
    pub size: u64,
}

/// Interrupt controller interface addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GicInfo {
    pub dist_addr: u64,
    pub cpu_addr: u64,
    pub hyp_addr: u64,
    pub vcpu_addr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootModule {
    pub start: u64,
    pub size: u64,
    pub cmdline: String,
}

/// Why a node was skipped.
#[derive(Debug, Error)]
enum NodeError {
    #[error("invalid #address-cells or #size-cells")]
    InvalidCells,
    #[error("missing `reg' property")]
    MissingReg,
    #[error("not enough ranges")]
    NotEnoughRanges,
    #[error("not a known multiboot module type")]
    UnknownModule,
    #[error("module {0} command line too long")]
    CmdlineTooLong(usize),
    #[error("range {start:#x}+{size:#x} wraps the address space")]
    RangeOverflow { start: u64, size: u64 },
    #[error(transparent)]
    Fdt(#[from] FdtError),
}

/// What the hypervisor learns from the device tree before it has a heap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EarlyInfo {
    pub mem_banks: Vec<MemBank>,
    pub possible_cpus: BTreeSet<u64>,
    pub gic: Option<GicInfo>,
    /// Slot 0 stands for the hypervisor itself; slots 1 and 2 hold the
    /// kernel and initrd.
    pub modules: [BootModule; NR_MODULES + 1],
    /// Highest module slot filled.
    pub nr_mods: usize,
    /// Names of nodes that were recognized but malformed.
    pub skipped: Vec<String>,
}

impl EarlyInfo {
    /// Collect memory banks, CPUs, the GIC and boot modules.
    ///
    /// Malformed nodes are logged and skipped; only a structurally broken
    /// tree is an error.
    pub fn scan(tree: &DeviceTree<'_>) -> Result<Self, FdtError> {
        let mut info = Self::default();

        for node in tree.nodes() {
            let node = node?;
            let outcome = if node.name_matches("memory") {
                info.process_memory(tree, &node)
            } else if tree.type_matches(node.offset, "cpu") {
                info.process_cpu(tree, &node)
            } else if tree.is_compatible(node.offset, GIC_COMPATIBLE) {
                info.process_gic(tree, &node)
            } else if tree.is_compatible(node.offset, MULTIBOOT_COMPATIBLE) {
                info.process_module(tree, &node)
            } else {
                Ok(())
            };

            if let Err(reason) = outcome {
                tracing::warn!(node = node.display_name(), %reason, "fdt: skipping node");
                info.skipped.push(node.display_name().to_string());
            }
        }

        for line in info.to_string().lines().filter(|l| !l.is_empty()) {
            tracing::info!("{line}");
        }
        Ok(info)
    }

    fn ranges<'a>(
        tree: &DeviceTree<'a>,
        node: &NodeRecord<'a>,
    ) -> Result<Vec<RegRange>, NodeError> {
        match tree.reg(node) {
            Err(FdtError::MissingProperty { .. }) => Err(NodeError::MissingReg),
            other => Ok(other?),
        }
    }

    fn checked(range: RegRange) -> Result<RegRange, NodeError> {
        match range.end() {
            Some(_) => Ok(range),
            None => Err(NodeError::RangeOverflow {
                start: range.start,
                size: range.size,
            }),
        }
    }

    fn process_memory(
        &mut self,
        tree: &DeviceTree<'_>,
        node: &NodeRecord<'_>,
    ) -> Result<(), NodeError> {
        if node.address_cells < 1 || node.size_cells < 1 {
            return Err(NodeError::InvalidCells);
        }
        let ranges = Self::ranges(tree, node)?
            .into_iter()
            .map(Self::checked)
            .collect::<Result<Vec<_>, _>>()?;
        for range in ranges {
            if self.mem_banks.len() >= NR_MEM_BANKS {
                break;
            }
            self.mem_banks.push(MemBank {
                start: range.start,
                size: range.size,
            });
        }
        Ok(())
    }

    fn process_cpu(&mut self, tree: &DeviceTree<'_>, node: &NodeRecord<'_>) -> Result<(), NodeError> {
        if node.address_cells != 1 || node.size_cells != 0 {
            return Err(NodeError::InvalidCells);
        }
        let id = Self::ranges(tree, node)?
            .first()
            .map(|r| r.start)
            .ok_or(NodeError::MissingReg)?;
        self.possible_cpus.insert(id);
        Ok(())
    }

    fn process_gic(&mut self, tree: &DeviceTree<'_>, node: &NodeRecord<'_>) -> Result<(), NodeError> {
        if node.address_cells < 1 || node.size_cells < 1 {
            return Err(NodeError::InvalidCells);
        }
        match Self::ranges(tree, node)?.as_slice() {
            [dist, cpu, hyp, vcpu, ..] => {
                self.gic = Some(GicInfo {
                    dist_addr: dist.start,
                    cpu_addr: cpu.start,
                    hyp_addr: hyp.start,
                    vcpu_addr: vcpu.start,
                });
                Ok(())
            }
            _ => Err(NodeError::NotEnoughRanges),
        }
    }

    fn process_module(
        &mut self,
        tree: &DeviceTree<'_>,
        node: &NodeRecord<'_>,
    ) -> Result<(), NodeError> {
        let nr = if tree.is_compatible(node.offset, KERNEL_MODULE) {
            1
        } else if tree.is_compatible(node.offset, INITRD_MODULE) {
            2
        } else {
            return Err(NodeError::UnknownModule);
        };

        let reg = Self::ranges(tree, node)?
            .first()
            .copied()
            .ok_or(NodeError::MissingReg)
            .and_then(Self::checked)?;

        let cmdline = match tree.property(node.offset, "bootargs") {
            Some(prop) if prop.value.len() > MODULE_CMDLINE_MAX => {
                return Err(NodeError::CmdlineTooLong(nr));
            }
            Some(prop) => prop.as_str().unwrap_or_default().to_string(),
            None => String::new(),
        };

        self.modules[nr] = BootModule {
            start: reg.start,
            size: reg.size,
            cmdline,
        };
        self.nr_mods = self.nr_mods.max(nr);
        Ok(())
    }
}

impl fmt::Display for EarlyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bank in &self.mem_banks {
            writeln!(
                f,
                "RAM: {:#018x} - {:#018x}",
                bank.start,
                bank.start.saturating_add(bank.size).saturating_sub(1)
            )?;
        }
        writeln!(f)?;
        for (i, module) in self.modules.iter().enumerate().take(self.nr_mods + 1).skip(1) {
            writeln!(
                f,
                "MODULE[{i}]: {:#018x} - {:#018x} {}",
                module.start,
                module.start.saturating_add(module.size),
                module.cmdline
            )?;
        }
        Ok(())
    }
}
