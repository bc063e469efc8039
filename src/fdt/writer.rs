//! Flattened device tree writer.

use zerocopy::big_endian::U32;
use zerocopy::IntoBytes;

use super::{
    FdtHeader, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP,
    FDT_VERSION, HEADER_SIZE,
};

/// Builds a device tree blob node by node.
///
/// Nodes are opened with [`FdtWriter::begin_node`] and closed with
/// [`FdtWriter::end_node`]; properties belong to the innermost open node
/// and must come before its children.
#[derive(Debug, Default)]
pub struct FdtWriter {
    buffer: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: Vec<(String, u32)>,
    boot_cpuid: u32,
}

impl FdtWriter {
    /// Memory reservation map: a single terminating entry.
    const MEM_RSVMAP_SIZE: usize = 16;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_boot_cpuid(&mut self, cpuid: u32) {
        self.boot_cpuid = cpuid;
    }

    pub fn begin_node(&mut self, name: &str) {
        self.write_u32(FDT_BEGIN_NODE);
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.push(0);
        self.align4();
    }

    pub fn end_node(&mut self) {
        self.write_u32(FDT_END_NODE);
    }

    /// Raw property.
    pub fn property(&mut self, name: &str, value: &[u8]) {
        let name_off = self.add_string(name);
        self.write_u32(FDT_PROP);
        self.write_u32(value.len() as u32);
        self.write_u32(name_off);
        self.buffer.extend_from_slice(value);
        self.align4();
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) {
        self.property(name, &value.to_be_bytes());
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &value);
    }

    pub fn prop_string(&mut self, name: &str, value: &str) {
        self.prop_strings(name, &[value]);
    }

    /// String-list property such as `compatible`.
    pub fn prop_strings(&mut self, name: &str, values: &[&str]) {
        let mut value = Vec::new();
        for s in values {
            value.extend_from_slice(s.as_bytes());
            value.push(0);
        }
        self.property(name, &value);
    }

    /// `reg` property of `(start, size)` ranges encoded with the given
    /// cell counts. Values wider than their cells are truncated.
    pub fn prop_reg(&mut self, ranges: &[(u64, u64)], address_cells: u32, size_cells: u32) {
        let mut cells = Vec::new();
        for &(start, size) in ranges {
            push_value(&mut cells, address_cells, start);
            push_value(&mut cells, size_cells, size);
        }
        self.prop_cells("reg", &cells);
    }

    /// Terminate the structure block and assemble the blob.
    pub fn finish(mut self) -> Vec<u8> {
        self.write_u32(FDT_END);

        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + Self::MEM_RSVMAP_SIZE;
        let off_dt_strings = off_dt_struct + self.buffer.len();
        let total_size = off_dt_strings + self.strings.len();

        let header = FdtHeader {
            magic: U32::new(FDT_MAGIC),
            totalsize: U32::new(total_size as u32),
            off_dt_struct: U32::new(off_dt_struct as u32),
            off_dt_strings: U32::new(off_dt_strings as u32),
            off_mem_rsvmap: U32::new(off_mem_rsvmap as u32),
            version: U32::new(FDT_VERSION),
            last_comp_version: U32::new(FDT_LAST_COMP_VERSION),
            boot_cpuid_phys: U32::new(self.boot_cpuid),
            size_dt_strings: U32::new(self.strings.len() as u32),
            size_dt_struct: U32::new(self.buffer.len() as u32),
        };

        let mut fdt = Vec::with_capacity(total_size);
        fdt.extend_from_slice(header.as_bytes());
        fdt.resize(fdt.len() + Self::MEM_RSVMAP_SIZE, 0);
        fdt.extend_from_slice(&self.buffer);
        fdt.extend_from_slice(&self.strings);
        fdt
    }

    fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn align4(&mut self) {
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
    }

    fn add_string(&mut self, s: &str) -> u32 {
        if let Some((_, offset)) = self.string_offsets.iter().find(|(existing, _)| existing == s) {
            return *offset;
        }

        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.string_offsets.push((s.to_string(), offset));
        offset
    }
}

/// Append `val` as `cells` big-endian cells, most significant first.
fn push_value(out: &mut Vec<u32>, cells: u32, val: u64) {
    let start = out.len();
    out.resize(start + cells as usize, 0);
    let mut val = val;
    for cell in out[start..].iter_mut().rev() {
        *cell = val as u32;
        val = val.checked_shr(32).unwrap_or(0);
    }
}
