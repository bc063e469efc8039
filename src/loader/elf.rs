//! Validation of the 32-bit ELF boot image.
//!
//! The image is only ever read. Every table the loader touches later is
//! bounds checked here, so loading cannot index outside the image.

use std::ops::Range;

use thiserror::Error;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::memory::layout::{HVM_LOADER_ENTRY, PAGE_SIZE};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;

const PT_LOAD: u32 = 1;
pub(crate) const PF_X: u32 = 1;
pub(crate) const PF_W: u32 = 2;

const SHN_UNDEF: u16 = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("kernel image does not have an ELF header")]
    NotElf,
    #[error("image is too small for an ELF header ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported ELF class {0} (expected 32-bit)")]
    UnsupportedClass(u8),
    #[error("ELF program headers extend beyond end of image")]
    ProgramHeadersOutOfBounds,
    #[error("ELF section headers extend beyond end of image")]
    SectionHeadersOutOfBounds,
    #[error("ELF header entry size {size} is smaller than {expected}")]
    BadEntrySize { size: u16, expected: usize },
    #[error("ELF image has no section-header strings table (shstrtab)")]
    MissingStringTable,
    #[error("ELF section-header strings table extends beyond end of image")]
    StringTableOutOfBounds,
    #[error("loadable segment {index} extends beyond end of image")]
    SegmentOutOfBounds { index: usize },
    #[error("loadable segment {index} is larger on disk than in memory")]
    SegmentFileSizeTooLarge { index: usize },
    #[error("loadable segment {index} wraps the 32-bit address space")]
    SegmentAddressOverflow { index: usize },
    #[error("malformed ELF image: no loadable segments")]
    NoLoadableSegments,
    #[error("malformed ELF image: entry {entry:#x} outside {start:#x}..={end:#x}")]
    EntryOutOfRange { entry: u64, start: u64, end: u64 },
    #[error("guest OS must load to a page boundary (start {0:#x})")]
    Unaligned(u64),
}

pub type Result<T> = std::result::Result<T, ImageError>;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Elf32Ehdr {
    e_ident: [u8; 16],
    e_type: U16,
    e_machine: U16,
    e_version: U32,
    e_entry: U32,
    e_phoff: U32,
    e_shoff: U32,
    e_flags: U32,
    e_ehsize: U16,
    e_phentsize: U16,
    e_phnum: U16,
    e_shentsize: U16,
    e_shnum: U16,
    e_shstrndx: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Elf32Phdr {
    p_type: U32,
    p_offset: U32,
    p_vaddr: U32,
    p_paddr: U32,
    p_filesz: U32,
    p_memsz: U32,
    p_flags: U32,
    p_align: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Elf32Shdr {
    sh_name: U32,
    sh_type: U32,
    sh_flags: U32,
    sh_addr: U32,
    sh_offset: U32,
    sh_size: U32,
    sh_link: U32,
    sh_info: U32,
    sh_addralign: U32,
    sh_entsize: U32,
}

/// Facts derived from a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupInfo {
    /// Lowest physical address of any loadable segment.
    pub kernel_start: u64,
    /// Highest `paddr + memsz` of any loadable segment.
    pub kernel_end: u64,
    /// Base subtracted from segment addresses when loading. Always 0.
    pub load_base: u64,
    /// Runtime entry point. Always the firmware loader's address, never the
    /// entry declared by the image.
    pub entry_point: u64,
    pub end_of_image: u64,
}

/// A loadable program segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub paddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
}

impl Segment {
    /// Segments that are loaded: PT_LOAD and writable or executable.
    fn is_loadable(phdr: &Elf32Phdr) -> bool {
        phdr.p_type.get() == PT_LOAD && (phdr.p_flags.get() & (PF_W | PF_X)) != 0
    }

    fn file_range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.filesz) as usize
    }
}

/// A validated boot image.
#[derive(Debug, Clone)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    ehdr: Elf32Ehdr,
    shstrtab: &'a [u8],
    segments: Vec<Segment>,
    setup: SetupInfo,
}

/// `base + count * size <= len`, computed without overflow.
fn table_fits(base: u32, count: u16, size: u16, len: usize) -> bool {
    u64::from(base) + u64::from(count) * u64::from(size) <= len as u64
}

fn read_at<T: FromBytes + KnownLayout + Immutable>(data: &[u8], offset: u64) -> Option<T> {
    let offset = usize::try_from(offset).ok()?;
    let bytes = data.get(offset..)?;
    T::read_from_prefix(bytes).ok().map(|(v, _)| v)
}

impl<'a> ElfImage<'a> {
    /// Parse and bounds-check `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < ELF_MAGIC.len() || &data[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(ImageError::NotElf);
        }
        let ehdr: Elf32Ehdr = read_at(data, 0).ok_or(ImageError::Truncated(data.len()))?;
        if ehdr.e_ident[EI_CLASS] != ELFCLASS32 {
            return Err(ImageError::UnsupportedClass(ehdr.e_ident[EI_CLASS]));
        }

        let phnum = ehdr.e_phnum.get();
        let phentsize = ehdr.e_phentsize.get();
        if !table_fits(ehdr.e_phoff.get(), phnum, phentsize, data.len()) {
            return Err(ImageError::ProgramHeadersOutOfBounds);
        }
        if phnum > 0 && usize::from(phentsize) < std::mem::size_of::<Elf32Phdr>() {
            return Err(ImageError::BadEntrySize {
                size: phentsize,
                expected: std::mem::size_of::<Elf32Phdr>(),
            });
        }

        let shnum = ehdr.e_shnum.get();
        let shentsize = ehdr.e_shentsize.get();
        if !table_fits(ehdr.e_shoff.get(), shnum, shentsize, data.len()) {
            return Err(ImageError::SectionHeadersOutOfBounds);
        }

        let shstrtab = Self::string_table(data, &ehdr)?;
        let segments = Self::loadable_segments(data, &ehdr)?;

        let (kernel_start, kernel_end) = segments.iter().fold((u64::MAX, 0), |(lo, hi), s| {
            (lo.min(s.paddr), hi.max(s.paddr + s.memsz))
        });
        if kernel_start > kernel_end {
            return Err(ImageError::NoLoadableSegments);
        }

        let entry = u64::from(ehdr.e_entry.get());
        if entry < kernel_start || entry > kernel_end {
            return Err(ImageError::EntryOutOfRange {
                entry,
                start: kernel_start,
                end: kernel_end,
            });
        }

        if kernel_start & (PAGE_SIZE - 1) != 0 {
            return Err(ImageError::Unaligned(kernel_start));
        }

        let setup = SetupInfo {
            kernel_start,
            kernel_end,
            load_base: 0,
            entry_point: HVM_LOADER_ENTRY,
            end_of_image: kernel_end,
        };

        tracing::debug!(
            segments = segments.len(),
            declared_entry = entry,
            "validated boot image"
        );

        Ok(Self {
            data,
            ehdr,
            shstrtab,
            segments,
            setup,
        })
    }

    fn string_table(data: &'a [u8], ehdr: &Elf32Ehdr) -> Result<&'a [u8]> {
        let index = ehdr.e_shstrndx.get();
        if index == SHN_UNDEF {
            return Err(ImageError::MissingStringTable);
        }
        if index >= ehdr.e_shnum.get()
            || usize::from(ehdr.e_shentsize.get()) < std::mem::size_of::<Elf32Shdr>()
        {
            return Err(ImageError::StringTableOutOfBounds);
        }

        let offset =
            u64::from(ehdr.e_shoff.get()) + u64::from(index) * u64::from(ehdr.e_shentsize.get());
        let shdr: Elf32Shdr = read_at(data, offset).ok_or(ImageError::StringTableOutOfBounds)?;
        let start = shdr.sh_offset.get() as usize;
        let end = start
            .checked_add(shdr.sh_size.get() as usize)
            .ok_or(ImageError::StringTableOutOfBounds)?;
        data.get(start..end).ok_or(ImageError::StringTableOutOfBounds)
    }

    fn loadable_segments(data: &[u8], ehdr: &Elf32Ehdr) -> Result<Vec<Segment>> {
        let phoff = u64::from(ehdr.e_phoff.get());
        let phentsize = u64::from(ehdr.e_phentsize.get());

        let mut segments = Vec::new();
        for index in 0..usize::from(ehdr.e_phnum.get()) {
            let phdr: Elf32Phdr = read_at(data, phoff + index as u64 * phentsize)
                .ok_or(ImageError::ProgramHeadersOutOfBounds)?;
            if !Segment::is_loadable(&phdr) {
                continue;
            }

            let segment = Segment {
                paddr: u64::from(phdr.p_paddr.get()),
                offset: u64::from(phdr.p_offset.get()),
                filesz: u64::from(phdr.p_filesz.get()),
                memsz: u64::from(phdr.p_memsz.get()),
                flags: phdr.p_flags.get(),
            };
            if segment.offset + segment.filesz > data.len() as u64 {
                return Err(ImageError::SegmentOutOfBounds { index });
            }
            if segment.filesz > segment.memsz {
                return Err(ImageError::SegmentFileSizeTooLarge { index });
            }
            if segment.paddr + segment.memsz > 1 << 32 {
                return Err(ImageError::SegmentAddressOverflow { index });
            }
            segments.push(segment);
        }
        Ok(segments)
    }

    pub fn setup(&self) -> &SetupInfo {
        &self.setup
    }

    /// Loadable segments, in program header order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// On-disk bytes of a segment returned by [`ElfImage::segments`].
    pub fn segment_data(&self, segment: &Segment) -> &'a [u8] {
        &self.data[segment.file_range()]
    }

    /// Entry point recorded in the image header.
    pub fn declared_entry(&self) -> u64 {
        u64::from(self.ehdr.e_entry.get())
    }

    /// Names of all sections, resolved through the string table.
    pub fn section_names(&self) -> Vec<String> {
        let shoff = u64::from(self.ehdr.e_shoff.get());
        let shentsize = u64::from(self.ehdr.e_shentsize.get());
        (0..u64::from(self.ehdr.e_shnum.get()))
            .filter_map(|i| read_at::<Elf32Shdr>(self.data, shoff + i * shentsize))
            .map(|shdr| {
                let start = (shdr.sh_name.get() as usize).min(self.shstrtab.len());
                let name = &self.shstrtab[start..];
                let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                String::from_utf8_lossy(&name[..len]).into_owned()
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_image::*;
    use super::*;

    fn simple() -> ElfBuilder {
        ElfBuilder::new(0x100010).segment(0x100000, vec![0x90; 0x800], 0x100000, PF_R | PF_X)
    }

    #[test]
    fn test_valid_image() {
        let bytes = simple().build();
        let image = ElfImage::parse(&bytes).unwrap();
        let setup = image.setup();

        assert_eq!(setup.kernel_start, 0x100000);
        assert_eq!(setup.kernel_end, 0x200000);
        assert_eq!(setup.load_base, 0);
        assert_eq!(setup.entry_point, HVM_LOADER_ENTRY);
        assert_eq!(image.declared_entry(), 0x100010);
        assert_eq!(image.segments().len(), 1);
        assert_eq!(image.segment_data(&image.segments()[0]), &[0x90; 0x800][..]);
        assert_eq!(image.section_names(), vec!["", ".shstrtab", ".text"]);
    }

    #[test]
    fn test_entry_forced_to_loader() {
        let bytes = ElfBuilder::new(0x180000)
            .segment(0x100000, vec![1; 16], 0x100000, PF_W)
            .build();
        let image = ElfImage::parse(&bytes).unwrap();
        assert_eq!(image.setup().entry_point, 0x100000);
        assert_eq!(image.declared_entry(), 0x180000);
    }

    #[test]
    fn test_span_covers_all_loadable_segments() {
        let bytes = ElfBuilder::new(0x100000)
            .segment(0x200000, vec![1; 16], 0x3000, PF_W)
            .segment(0x100000, vec![2; 16], 0x1000, PF_X)
            .segment(0x800000, vec![3; 16], 0x1000, PF_R)
            .build();
        let image = ElfImage::parse(&bytes).unwrap();
        assert_eq!(image.segments().len(), 2);
        assert_eq!(image.setup().kernel_start, 0x100000);
        assert_eq!(image.setup().kernel_end, 0x203000);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = simple().build();
        bytes[1] = b'X';
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ImageError::NotElf);
        assert_eq!(ElfImage::parse(b"\x7fE").unwrap_err(), ImageError::NotElf);
    }

    #[test]
    fn test_truncated_header() {
        let bytes = simple().build();
        assert_eq!(
            ElfImage::parse(&bytes[..40]).unwrap_err(),
            ImageError::Truncated(40)
        );
    }

    #[test]
    fn test_64bit_class_rejected() {
        let mut bytes = simple().build();
        bytes[EI_CLASS] = 2;
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::UnsupportedClass(2)
        );
    }

    #[test]
    fn test_program_headers_out_of_bounds() {
        let mut bytes = simple().build();
        let len = bytes.len() as u32;
        put32(&mut bytes, 28, len - 8);
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::ProgramHeadersOutOfBounds
        );
    }

    #[test]
    fn test_section_headers_out_of_bounds() {
        let mut bytes = simple().build();
        put16(&mut bytes, 48, 0x400);
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::SectionHeadersOutOfBounds
        );
    }

    #[test]
    fn test_missing_string_table() {
        let mut builder = simple();
        builder.with_shstrtab = false;
        assert_eq!(
            ElfImage::parse(&builder.build()).unwrap_err(),
            ImageError::MissingStringTable
        );
    }

    #[test]
    fn test_string_table_index_out_of_range() {
        let mut bytes = simple().build();
        put16(&mut bytes, 50, 7);
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::StringTableOutOfBounds
        );
    }

    #[test]
    fn test_no_loadable_segments() {
        let bytes = ElfBuilder::new(0x100000).note(0x100000, vec![0; 8]).build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::NoLoadableSegments
        );
    }

    #[test]
    fn test_read_only_segment_is_not_loadable() {
        let bytes = ElfBuilder::new(0x100000)
            .segment(0x100000, vec![0; 8], 0x1000, PF_R)
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::NoLoadableSegments
        );
    }

    #[test]
    fn test_entry_outside_span() {
        let bytes = ElfBuilder::new(0x300000)
            .segment(0x100000, vec![0; 8], 0x1000, PF_X)
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::EntryOutOfRange {
                entry: 0x300000,
                start: 0x100000,
                end: 0x101000,
            }
        );
    }

    #[test]
    fn test_entry_at_span_end_accepted() {
        let bytes = ElfBuilder::new(0x101000)
            .segment(0x100000, vec![0; 8], 0x1000, PF_X)
            .build();
        assert!(ElfImage::parse(&bytes).is_ok());
    }

    #[test]
    fn test_segment_file_range_out_of_bounds() {
        let mut bytes = simple().build();
        // p_filesz of the only program header
        put32(&mut bytes, 52 + 16, 0x10_0000);
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::SegmentOutOfBounds { index: 0 }
        );
    }

    #[test]
    fn test_filesz_larger_than_memsz() {
        let bytes = ElfBuilder::new(0x100000)
            .segment(0x100000, vec![0; 0x20], 0x10, PF_X)
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::SegmentFileSizeTooLarge { index: 0 }
        );
    }

    #[test]
    fn test_segment_wraps_address_space() {
        let bytes = ElfBuilder::new(0xffff_f000)
            .segment(0xffff_f000, vec![0; 0x20], 0x2000, PF_X)
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::SegmentAddressOverflow { index: 0 }
        );
    }

    #[test]
    fn test_unaligned_start() {
        let bytes = ElfBuilder::new(0x100100)
            .segment(0x100080, vec![0; 0x20], 0x1000, PF_X)
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ImageError::Unaligned(0x100080)
        );
    }
}
