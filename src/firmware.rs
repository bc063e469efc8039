//! Structures the second-stage firmware loader reads at boot.
//!
//! Both tables live at fixed guest physical locations: the boot-info table
//! inside the reserved page below the VGA hole, the memory map in its own
//! page at `0x90000`.

use std::fmt;

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::backend::Hypervisor;
use crate::error::Result;
use crate::memory::layout::{E820_MAP_PAGE, HVM_INFO_OFFSET, HVM_INFO_PFN, PAGE_SHIFT};
use crate::memory::{FirmwareMemoryMap, GuestWriter};

/// Boot-info table handed to the firmware loader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HvmInfoTable {
    signature: [u8; 8],
    length: U32,
    checksum: u8,
    acpi_enabled: u8,
    reserved: [u8; 2],
    nr_vcpus: U32,
}

impl HvmInfoTable {
    pub const SIGNATURE: [u8; 8] = *b"HVM INFO";
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a table with a valid checksum.
    pub fn new(nr_vcpus: u32, acpi_enabled: bool) -> Self {
        let mut table = Self {
            signature: Self::SIGNATURE,
            length: U32::new(Self::SIZE as u32),
            checksum: 0,
            acpi_enabled: u8::from(acpi_enabled),
            reserved: [0; 2],
            nr_vcpus: U32::new(nr_vcpus),
        };
        table.checksum = byte_sum(table.as_bytes()).wrapping_neg();
        table
    }

    /// Decode a table from the start of `bytes`.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(table, _)| table)
    }

    pub fn signature(&self) -> &[u8; 8] {
        &self.signature
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn nr_vcpus(&self) -> u32 {
        self.nr_vcpus.get()
    }

    pub fn acpi_enabled(&self) -> bool {
        self.acpi_enabled != 0
    }

    /// Whether all bytes of the table, checksum included, sum to zero.
    pub fn is_valid(&self) -> bool {
        self.signature == Self::SIGNATURE && byte_sum(self.as_bytes()) == 0
    }
}

impl fmt::Display for HvmInfoTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} len={} checksum={:#04x} acpi={} vcpus={}",
            String::from_utf8_lossy(&self.signature),
            self.length(),
            self.checksum,
            self.acpi_enabled,
            self.nr_vcpus()
        )
    }
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Write the boot-info table into a freshly zeroed info page.
pub fn publish_hvm_info<H: Hypervisor>(
    mem: &mut GuestWriter<'_, H>,
    nr_vcpus: u32,
    acpi_enabled: bool,
) -> Result<HvmInfoTable> {
    let table = HvmInfoTable::new(nr_vcpus, acpi_enabled);
    mem.with_page(HVM_INFO_PFN, |page| {
        page.fill(0);
        page[HVM_INFO_OFFSET..HVM_INFO_OFFSET + HvmInfoTable::SIZE]
            .copy_from_slice(table.as_bytes());
    })?;
    tracing::debug!(%table, "published boot-info table");
    Ok(table)
}

/// Write the legacy memory map into its freshly zeroed page.
pub fn publish_e820<H: Hypervisor>(
    mem: &mut GuestWriter<'_, H>,
    map: &FirmwareMemoryMap,
) -> Result<()> {
    mem.with_page(E820_MAP_PAGE >> PAGE_SHIFT, |page| {
        page.fill(0);
        map.write_to(page);
    })?;
    tracing::debug!(entries = map.len(), "published memory map");
    Ok(())
}
