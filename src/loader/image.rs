//! Copies a validated image into guest memory.

use crate::error::Result;
use crate::loader::elf::ElfImage;
use crate::memory::MemoryWriter;

/// Load every loadable segment of `image`.
///
/// Each segment's file bytes land at `paddr - load_base`; the remainder up
/// to `memsz` is zeroed.
pub fn load_segments(image: &ElfImage<'_>, mem: &mut impl MemoryWriter) -> Result<()> {
    let load_base = image.setup().load_base;

    for segment in image.segments() {
        let dest = segment.paddr - load_base;
        mem.write(dest, image.segment_data(segment))?;

        let tail = segment.memsz - segment.filesz;
        if tail > 0 {
            mem.zero(dest + segment.filesz, tail)?;
        }

        tracing::debug!(
            paddr = segment.paddr,
            filesz = segment.filesz,
            memsz = segment.memsz,
            "loaded segment"
        );
    }
    Ok(())
}
