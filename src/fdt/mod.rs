//! Read-only access to flattened device trees.
//!
//! A [`DeviceTree`] borrows the blob and decodes it on demand. Node walks
//! are lazy: [`DeviceTree::nodes`] keeps the cell counts inherited from
//! enclosing buses on an explicit stack and yields one [`NodeRecord`] per
//! node, in document order.

mod early;
mod writer;

pub use early::{BootModule, EarlyInfo, GicInfo, MemBank, NR_MEM_BANKS, NR_MODULES};
pub use writer::FdtWriter;

use std::fmt::Write as _;

use thiserror::Error;
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub(crate) const FDT_MAGIC: u32 = 0xd00dfeed;
pub(crate) const FDT_VERSION: u32 = 17;
pub(crate) const FDT_LAST_COMP_VERSION: u32 = 16;

pub(crate) const FDT_BEGIN_NODE: u32 = 0x1;
pub(crate) const FDT_END_NODE: u32 = 0x2;
pub(crate) const FDT_PROP: u32 = 0x3;
pub(crate) const FDT_NOP: u32 = 0x4;
pub(crate) const FDT_END: u32 = 0x9;

/// Cell counts assumed above the root node.
pub const DEFAULT_ADDRESS_CELLS: u32 = 2;
pub const DEFAULT_SIZE_CELLS: u32 = 1;

/// Largest number of cells in one `reg` value.
const MAX_VALUE_CELLS: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FdtError {
    #[error("no valid device tree: bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("device tree blob truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported device tree version {0}")]
    UnsupportedVersion(u32),
    #[error("device tree {0} block lies outside the blob")]
    BlockOutOfBounds(&'static str),
    #[error("unexpected end of structure block at {0:#x}")]
    UnexpectedEnd(usize),
    #[error("unknown token {token:#x} at {offset:#x}")]
    BadToken { offset: usize, token: u32 },
    #[error("malformed node name at {0:#x}")]
    BadName(usize),
    #[error("malformed property at {0:#x}")]
    BadProperty(usize),
    #[error("property name offset {0:#x} outside strings block")]
    BadString(u32),
    #[error("offset {0:#x} is not a node")]
    NotANode(usize),
    #[error("unbalanced node nesting")]
    UnbalancedNodes,
    #[error("dtb value contains {0} cells (at most 2 supported)")]
    TooManyCells(u32),
    #[error("node `{node}': missing `{name}' property")]
    MissingProperty { node: String, name: &'static str },
}

pub type Result<T> = std::result::Result<T, FdtError>;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct FdtHeader {
    pub magic: U32,
    pub totalsize: U32,
    pub off_dt_struct: U32,
    pub off_dt_strings: U32,
    pub off_mem_rsvmap: U32,
    pub version: U32,
    pub last_comp_version: U32,
    pub boot_cpuid_phys: U32,
    pub size_dt_strings: U32,
    pub size_dt_struct: U32,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<FdtHeader>();

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn be32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos.checked_add(4)?)?;
    raw.try_into().ok().map(u32::from_be_bytes)
}

fn cstr(bytes: &[u8], pos: usize) -> Option<&str> {
    let rest = bytes.get(pos..)?;
    let len = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..len]).ok()
}

/// A named property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

impl<'a> Property<'a> {
    /// First cell of the value.
    pub fn as_u32(&self) -> Option<u32> {
        be32(self.value, 0)
    }

    /// Value up to its first NUL.
    pub fn as_str(&self) -> Option<&'a str> {
        let len = self
            .value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.value.len());
        std::str::from_utf8(&self.value[..len]).ok()
    }

    /// NUL separated strings of a string-list value.
    pub fn strings(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let empty = self.value.is_empty();
        let value = self.value.strip_suffix(&[0]).unwrap_or(self.value);
        value.split(|&b| b == 0).filter(move |_| !empty)
    }
}

/// One node seen by a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord<'a> {
    /// Offset of the node in the structure block.
    pub offset: usize,
    pub name: &'a str,
    pub depth: usize,
    /// Cells of the enclosing bus; these govern this node's `reg`.
    pub address_cells: u32,
    pub size_cells: u32,
    /// Cells this node declares for its children.
    pub own_address_cells: u32,
    pub own_size_cells: u32,
}

impl NodeRecord<'_> {
    /// Matches `name` and `name@unit`, but not `name-suffix`.
    pub fn name_matches(&self, name: &str) -> bool {
        match self.name.strip_prefix(name) {
            Some(rest) => rest.is_empty() || rest.starts_with('@'),
            None => false,
        }
    }

    /// Name as printed: the root is `/`.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "/"
        } else {
            self.name
        }
    }
}

/// A decoded `reg` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegRange {
    pub start: u64,
    pub size: u64,
}

impl RegRange {
    /// First address past the range, or `None` if it wraps.
    pub fn end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }
}

fn read_value(cells: &[u32], count: u32) -> u64 {
    cells
        .iter()
        .take(count as usize)
        .fold(0u64, |val, &c| (val << 32) | u64::from(c))
}

/// Decode a `reg` value into ranges of `address_cells` + `size_cells`.
///
/// Trailing bytes that do not form a whole range are ignored.
pub fn decode_reg(value: &[u8], address_cells: u32, size_cells: u32) -> Result<Vec<RegRange>> {
    for cells in [address_cells, size_cells] {
        if cells > MAX_VALUE_CELLS {
            return Err(FdtError::TooManyCells(cells));
        }
    }
    let per_range = (address_cells + size_cells) as usize;
    if per_range == 0 {
        return Ok(Vec::new());
    }

    let cells: Vec<u32> = value
        .chunks_exact(4)
        .filter_map(|c| c.try_into().ok().map(u32::from_be_bytes))
        .collect();
    Ok(cells
        .chunks_exact(per_range)
        .map(|range| {
            let (addr, size) = range.split_at(address_cells as usize);
            RegRange {
                start: read_value(addr, address_cells),
                size: read_value(size, size_cells),
            }
        })
        .collect())
}

enum Token<'a> {
    BeginNode { name: &'a str, next: usize },
    EndNode { next: usize },
    Prop { prop: Property<'a>, next: usize },
    Nop { next: usize },
    End,
}

/// A validated flattened device tree.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTree<'a> {
    header: FdtHeader,
    structure: &'a [u8],
    strings: &'a [u8],
}

impl<'a> DeviceTree<'a> {
    /// Check the header and locate the structure and strings blocks.
    pub fn parse(blob: &'a [u8]) -> Result<Self> {
        let (header, _) =
            FdtHeader::read_from_prefix(blob).map_err(|_| FdtError::Truncated(blob.len()))?;
        if header.magic.get() != FDT_MAGIC {
            return Err(FdtError::BadMagic(header.magic.get()));
        }
        let total = header.totalsize.get() as usize;
        if total > blob.len() || total < HEADER_SIZE {
            return Err(FdtError::Truncated(blob.len()));
        }
        let version = header.version.get();
        if version < FDT_LAST_COMP_VERSION {
            return Err(FdtError::UnsupportedVersion(version));
        }
        let blob = &blob[..total];

        let off_struct = header.off_dt_struct.get() as usize;
        let struct_size = if version >= FDT_VERSION {
            header.size_dt_struct.get() as usize
        } else {
            total.saturating_sub(off_struct)
        };
        let structure = Self::block(blob, off_struct, struct_size, "structure")?;
        let strings = Self::block(
            blob,
            header.off_dt_strings.get() as usize,
            header.size_dt_strings.get() as usize,
            "strings",
        )?;
        if header.off_mem_rsvmap.get() as usize > total {
            return Err(FdtError::BlockOutOfBounds("memory reservation"));
        }

        Ok(Self {
            header,
            structure,
            strings,
        })
    }

    fn block(blob: &'a [u8], start: usize, size: usize, name: &'static str) -> Result<&'a [u8]> {
        start
            .checked_add(size)
            .and_then(|end| blob.get(start..end))
            .ok_or(FdtError::BlockOutOfBounds(name))
    }

    pub fn total_size(&self) -> usize {
        self.header.totalsize.get() as usize
    }

    pub fn version(&self) -> u32 {
        self.header.version.get()
    }

    pub fn boot_cpuid(&self) -> u32 {
        self.header.boot_cpuid_phys.get()
    }

    fn token_at(&self, pos: usize) -> Result<Token<'a>> {
        let token = be32(self.structure, pos).ok_or(FdtError::UnexpectedEnd(pos))?;
        match token {
            FDT_BEGIN_NODE => {
                let name = cstr(self.structure, pos + 4).ok_or(FdtError::BadName(pos))?;
                Ok(Token::BeginNode {
                    name,
                    next: align4(pos + 4 + name.len() + 1),
                })
            }
            FDT_END_NODE => Ok(Token::EndNode { next: pos + 4 }),
            FDT_PROP => {
                let len = be32(self.structure, pos + 4).ok_or(FdtError::BadProperty(pos))?;
                let nameoff = be32(self.structure, pos + 8).ok_or(FdtError::BadProperty(pos))?;
                let start = pos + 12;
                let value = start
                    .checked_add(len as usize)
                    .and_then(|end| self.structure.get(start..end))
                    .ok_or(FdtError::BadProperty(pos))?;
                let name =
                    cstr(self.strings, nameoff as usize).ok_or(FdtError::BadString(nameoff))?;
                Ok(Token::Prop {
                    prop: Property { name, value },
                    next: align4(start + value.len()),
                })
            }
            FDT_NOP => Ok(Token::Nop { next: pos + 4 }),
            FDT_END => Ok(Token::End),
            token => Err(FdtError::BadToken { offset: pos, token }),
        }
    }

    /// Walk every node, starting again from the root.
    pub fn nodes(&self) -> Nodes<'a> {
        Nodes {
            tree: *self,
            pos: 0,
            stack: Vec::new(),
            done: false,
        }
    }

    /// Properties of the node at `node`.
    pub fn props(&self, node: usize) -> Props<'a> {
        let (pos, pending) = match self.token_at(node) {
            Ok(Token::BeginNode { next, .. }) => (next, None),
            Ok(_) => (node, Some(FdtError::NotANode(node))),
            Err(e) => (node, Some(e)),
        };
        Props {
            tree: *self,
            pos,
            pending,
            done: false,
        }
    }

    pub fn property(&self, node: usize, name: &str) -> Option<Property<'a>> {
        self.props(node)
            .map_while(|p| p.ok())
            .find(|p| p.name == name)
    }

    /// First cell of property `name`, or `default` when it is absent or
    /// shorter than one cell.
    pub fn get_u32(&self, node: usize, name: &str, default: u32) -> u32 {
        self.property(node, name)
            .and_then(|p| p.as_u32())
            .unwrap_or(default)
    }

    /// Whether `compatible` lists `compat`.
    pub fn is_compatible(&self, node: usize, compat: &str) -> bool {
        self.property(node, "compatible")
            .is_some_and(|p| p.strings().any(|s| s == compat.as_bytes()))
    }

    /// Whether `device_type` equals `device_type`.
    pub fn type_matches(&self, node: usize, device_type: &str) -> bool {
        self.property(node, "device_type")
            .and_then(|p| p.as_str())
            .is_some_and(|t| t == device_type)
    }

    /// Decoded `reg` of `node`, using the cells of its enclosing bus.
    pub fn reg(&self, node: &NodeRecord<'a>) -> Result<Vec<RegRange>> {
        let prop = self
            .property(node.offset, "reg")
            .ok_or_else(|| FdtError::MissingProperty {
                node: node.display_name().to_string(),
                name: "reg",
            })?;
        decode_reg(prop.value, node.address_cells, node.size_cells)
    }

    /// First node whose `compatible` lists `compat`.
    pub fn find_compatible(&self, compat: &str) -> Result<Option<NodeRecord<'a>>> {
        for node in self.nodes() {
            let node = node?;
            if self.is_compatible(node.offset, compat) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// `/chosen/bootargs`.
    pub fn bootargs(&self) -> Result<Option<&'a str>> {
        for node in self.nodes() {
            let node = node?;
            if node.depth == 1 && node.name_matches("chosen") {
                return Ok(self
                    .property(node.offset, "bootargs")
                    .and_then(|p| p.as_str()));
            }
        }
        Ok(None)
    }

    /// Text outline of the tree: node names indented by depth, each
    /// followed by its property names.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        for node in self.nodes() {
            let node = node?;
            let prefix = "  ".repeat(node.depth);
            let _ = writeln!(out, "{prefix}{}:", node.display_name());
            for prop in self.props(node.offset) {
                let _ = writeln!(out, "{prefix}  {}", prop?.name);
            }
        }
        Ok(out)
    }
}

/// Iterator over all nodes of a tree. See [`DeviceTree::nodes`].
#[derive(Debug, Clone)]
pub struct Nodes<'a> {
    tree: DeviceTree<'a>,
    pos: usize,
    /// Cells declared by each open node, innermost last.
    stack: Vec<(u32, u32)>,
    done: bool,
}

impl<'a> Nodes<'a> {
    fn fail(&mut self, err: FdtError) -> Option<Result<NodeRecord<'a>>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for Nodes<'a> {
    type Item = Result<NodeRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let token = match self.tree.token_at(self.pos) {
                Ok(token) => token,
                Err(e) => return self.fail(e),
            };
            match token {
                Token::BeginNode { name, next } => {
                    let (address_cells, size_cells) = self
                        .stack
                        .last()
                        .copied()
                        .unwrap_or((DEFAULT_ADDRESS_CELLS, DEFAULT_SIZE_CELLS));
                    let record = NodeRecord {
                        offset: self.pos,
                        name,
                        depth: self.stack.len(),
                        address_cells,
                        size_cells,
                        own_address_cells: self.tree.get_u32(
                            self.pos,
                            "#address-cells",
                            address_cells,
                        ),
                        own_size_cells: self.tree.get_u32(self.pos, "#size-cells", size_cells),
                    };
                    self.stack
                        .push((record.own_address_cells, record.own_size_cells));
                    self.pos = next;
                    return Some(Ok(record));
                }
                Token::EndNode { next } => {
                    if self.stack.pop().is_none() {
                        return self.fail(FdtError::UnbalancedNodes);
                    }
                    self.pos = next;
                }
                Token::Prop { next, .. } | Token::Nop { next } => self.pos = next,
                Token::End => {
                    self.done = true;
                    if !self.stack.is_empty() {
                        return Some(Err(FdtError::UnbalancedNodes));
                    }
                }
            }
        }
        None
    }
}

/// Iterator over the properties of one node.
#[derive(Debug, Clone)]
pub struct Props<'a> {
    tree: DeviceTree<'a>,
    pos: usize,
    pending: Option<FdtError>,
    done: bool,
}

impl<'a> Iterator for Props<'a> {
    type Item = Result<Property<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }
        while !self.done {
            match self.tree.token_at(self.pos) {
                Ok(Token::Prop { prop, next }) => {
                    self.pos = next;
                    return Some(Ok(prop));
                }
                Ok(Token::Nop { next }) => self.pos = next,
                Ok(_) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut w = FdtWriter::new();
        w.begin_node("");
        w.prop_u32("#address-cells", 2);
        w.prop_u32("#size-cells", 2);
        w.prop_string("compatible", "linux,dummy-virt");

        w.begin_node("chosen");
        w.prop_string("bootargs", "console=hvc0 dom0_mem=512M");
        w.end_node();

        w.begin_node("memory@80000000");
        w.prop_string("device_type", "memory");
        w.prop_reg(&[(0x8000_0000, 0x4000_0000), (0x1_0000_0000, 0x1000_0000)], 2, 2);
        w.end_node();

        w.begin_node("cpus");
        w.prop_u32("#address-cells", 1);
        w.prop_u32("#size-cells", 0);
        w.begin_node("cpu@0");
        w.prop_string("device_type", "cpu");
        w.prop_u32("reg", 0);
        w.end_node();
        w.end_node();

        w.begin_node("memory-controller");
        w.prop_strings("compatible", &["vendor,mc", "simple-bus"]);
        w.end_node();

        w.end_node();
        w.finish()
    }

    #[test]
    fn test_header_validation() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        assert_eq!(tree.version(), 17);
        assert_eq!(tree.total_size(), blob.len());

        let mut bad = blob.clone();
        bad[0] = 0;
        assert!(matches!(DeviceTree::parse(&bad), Err(FdtError::BadMagic(_))));
        assert_eq!(
            DeviceTree::parse(&blob[..20]).unwrap_err(),
            FdtError::Truncated(20)
        );
        assert_eq!(
            DeviceTree::parse(&blob[..blob.len() - 1]).unwrap_err(),
            FdtError::Truncated(blob.len() - 1)
        );
    }

    #[test]
    fn test_old_version_rejected() {
        let mut blob = sample();
        blob[20..24].copy_from_slice(&15u32.to_be_bytes());
        assert_eq!(
            DeviceTree::parse(&blob).unwrap_err(),
            FdtError::UnsupportedVersion(15)
        );
    }

    #[test]
    fn test_strings_block_out_of_bounds() {
        let mut blob = sample();
        blob[32..36].copy_from_slice(&0x10000u32.to_be_bytes());
        assert_eq!(
            DeviceTree::parse(&blob).unwrap_err(),
            FdtError::BlockOutOfBounds("strings")
        );
    }

    #[test]
    fn test_walk_carries_parent_cells() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        let nodes: Vec<_> = tree.nodes().collect::<Result<_>>().unwrap();

        let names: Vec<_> = nodes.iter().map(|n| n.name).collect();
        assert_eq!(
            names,
            ["", "chosen", "memory@80000000", "cpus", "cpu@0", "memory-controller"]
        );

        let root = &nodes[0];
        assert_eq!((root.address_cells, root.size_cells), (2, 1));
        assert_eq!((root.own_address_cells, root.own_size_cells), (2, 2));

        let mem = &nodes[2];
        assert_eq!(mem.depth, 1);
        assert_eq!((mem.address_cells, mem.size_cells), (2, 2));

        let cpu = &nodes[4];
        assert_eq!(cpu.depth, 2);
        assert_eq!((cpu.address_cells, cpu.size_cells), (1, 0));
        // No own declaration: inherits the enclosing values.
        assert_eq!((cpu.own_address_cells, cpu.own_size_cells), (1, 0));
    }

    #[test]
    fn test_walk_is_restartable() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        assert_eq!(tree.nodes().count(), 6);
        assert_eq!(tree.nodes().count(), 6);
    }

    #[test]
    fn test_matching() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        let nodes: Vec<_> = tree.nodes().map(|n| n.unwrap()).collect();

        assert!(nodes[2].name_matches("memory"));
        assert!(!nodes[5].name_matches("memory"));
        assert!(tree.type_matches(nodes[4].offset, "cpu"));
        assert!(!tree.type_matches(nodes[2].offset, "cpu"));
        assert!(tree.is_compatible(nodes[5].offset, "simple-bus"));
        assert!(tree.is_compatible(nodes[5].offset, "vendor,mc"));
        assert!(!tree.is_compatible(nodes[5].offset, "simple"));
        assert_eq!(
            tree.find_compatible("simple-bus").unwrap().map(|n| n.name),
            Some("memory-controller")
        );
        assert_eq!(tree.find_compatible("nothing").unwrap(), None);
    }

    #[test]
    fn test_reg_and_u32() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        let nodes: Vec<_> = tree.nodes().map(|n| n.unwrap()).collect();

        assert_eq!(
            tree.reg(&nodes[2]).unwrap(),
            vec![
                RegRange {
                    start: 0x8000_0000,
                    size: 0x4000_0000
                },
                RegRange {
                    start: 0x1_0000_0000,
                    size: 0x1000_0000
                },
            ]
        );
        assert_eq!(tree.get_u32(nodes[3].offset, "#address-cells", 9), 1);
        assert_eq!(tree.get_u32(nodes[3].offset, "missing", 9), 9);
        assert!(matches!(
            tree.reg(&nodes[1]),
            Err(FdtError::MissingProperty { name: "reg", .. })
        ));
    }

    #[test]
    fn test_decode_reg_limits() {
        let value = [0u8; 24];
        assert_eq!(decode_reg(&value, 3, 0), Err(FdtError::TooManyCells(3)));
        assert!(decode_reg(&value, 0, 0).unwrap().is_empty());
        // 24 bytes hold one 2+2 range; the rest is ignored.
        assert_eq!(decode_reg(&value, 2, 2).unwrap().len(), 1);
    }

    #[test]
    fn test_reg_range_end() {
        let range = RegRange {
            start: 0x8000_0000,
            size: 0x1000,
        };
        assert_eq!(range.end(), Some(0x8000_1000));
        let wrapped = RegRange {
            start: 0xffff_ffff_ffff_f000,
            size: 0x10_0000,
        };
        assert_eq!(wrapped.end(), None);
    }

    #[test]
    fn test_bootargs_and_dump() {
        let blob = sample();
        let tree = DeviceTree::parse(&blob).unwrap();
        assert_eq!(tree.bootargs().unwrap(), Some("console=hvc0 dom0_mem=512M"));

        let dump = tree.dump().unwrap();
        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some("/:"));
        assert_eq!(lines.next(), Some("  #address-cells"));
        assert!(dump.contains("    cpu@0:\n      device_type\n      reg\n"));
    }

    #[test]
    fn test_unbalanced_tree() {
        let mut w = FdtWriter::new();
        w.begin_node("");
        w.begin_node("child");
        w.end_node();
        let blob = w.finish();

        let tree = DeviceTree::parse(&blob).unwrap();
        let results: Vec<_> = tree.nodes().collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[2], Err(FdtError::UnbalancedNodes));
    }

    #[test]
    fn test_bad_token() {
        let mut blob = sample();
        // First token of the structure block.
        let off = u32::from_be_bytes(blob[8..12].try_into().unwrap()) as usize;
        blob[off..off + 4].copy_from_slice(&7u32.to_be_bytes());
        let tree = DeviceTree::parse(&blob).unwrap();
        let first = tree.nodes().next().unwrap();
        assert_eq!(first, Err(FdtError::BadToken { offset: 0, token: 7 }));
    }
}
