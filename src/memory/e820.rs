//! Legacy (E820-style) memory map handed to the guest firmware loader.

use std::fmt;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::layout::*;
use super::MemoryLayout;

/// E820 memory map entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
}

impl fmt::Display for E820Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            E820Type::Ram => "RAM",
            E820Type::Reserved => "RESERVED",
            E820Type::Acpi => "ACPI",
            E820Type::Nvs => "ACPI_NVS",
        };
        f.write_str(name)
    }
}

/// E820 memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub typ: E820Type,
}

/// On-page encoding of an entry (packed, little endian).
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout)]
struct RawE820Entry {
    addr: U64,
    size: U64,
    typ: U32,
}

impl E820Entry {
    pub const SIZE: usize = 20;

    pub fn new(addr: u64, size: u64, typ: E820Type) -> Self {
        Self { addr, size, typ }
    }

    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let raw = RawE820Entry {
            addr: U64::new(self.addr),
            size: U64::new(self.size),
            typ: U32::new(self.typ as u32),
        };
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(raw.as_bytes());
        bytes
    }
}

/// Ordered list of memory map entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareMemoryMap {
    entries: Vec<E820Entry>,
}

impl FirmwareMemoryMap {
    /// Build the memory map for a guest.
    ///
    /// Low RAM stops three pages short of the ceiling to leave room for the
    /// I/O request, buffered I/O request and store pages. RAM above the
    /// MMIO window is described as a separate entry at 4 GiB.
    pub fn build(layout: &MemoryLayout) -> Self {
        let low_end = layout.low_mem_end();
        let mut entries = vec![
            E820Entry::new(0, LOW_RESERVED_START, E820Type::Ram),
            E820Entry::new(LOW_RESERVED_START, 0x1000, E820Type::Reserved),
            E820Entry::new(0xEA000, 0x1000, E820Type::Acpi),
            E820Entry::new(0xF0000, 0x10000, E820Type::Reserved),
            E820Entry::new(
                HIGH_MEMORY_START,
                low_end - HIGH_MEMORY_START - NR_RESERVED_PAGES * PAGE_SIZE,
                E820Type::Ram,
            ),
        ];

        let extra = layout.high_mem_size();
        if extra > 0 {
            entries.push(E820Entry::new(FOUR_GB, extra, E820Type::Ram));
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[E820Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes described as RAM.
    pub fn ram_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.typ == E820Type::Ram)
            .map(|e| e.size)
            .sum()
    }

    /// Write the map into a zeroed memory map page.
    pub fn write_to(&self, page: &mut [u8]) {
        page[E820_MAP_NR_OFFSET] = self.entries.len() as u8;
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = E820_MAP_OFFSET + i * E820Entry::SIZE;
            page[offset..offset + E820Entry::SIZE].copy_from_slice(&entry.to_bytes());
        }
    }
}

impl fmt::Display for FirmwareMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "{:#018x} - {:#018x} {}", e.addr, e.end(), e.typ)?;
        }
        Ok(())
    }
}
