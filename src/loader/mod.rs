//! Boot image validation and loading.
//!
//! [`elf`] checks the image and derives its [`SetupInfo`]; [`image`] copies
//! the loadable segments into guest memory.

pub mod elf;
pub mod image;

pub use elf::{ElfImage, ImageError, Segment, SetupInfo};
pub use image::load_segments;
