//! Error types for hvmbuild.

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::{DomId, HypercallError};
use crate::fdt::FdtError;
use crate::loader::elf::ImageError;

/// Result type alias using hvmbuild's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building a guest domain.
///
/// Every variant is terminal for the build attempt that produced it. The
/// hypervisor-side state of the domain is left as-is; tearing down a
/// half-built domain is the caller's job.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("invalid memory size: {0} MB")]
    InvalidMemorySize(u32),

    #[error("invalid vCPU count: {0} (must be 1..={max})", max = crate::shared::MAX_VIRT_CPUS)]
    InvalidVcpuCount(u32),

    #[error("image required")]
    ImageRequired,

    #[error("image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("unable to inflate image buffer: {0}")]
    Inflate(#[source] std::io::Error),

    // Malformed input
    #[error("bad image format: {0}")]
    InvalidImage(#[from] ImageError),

    // Resource exhaustion
    #[error(
        "initial guest OS requires too much space: ({}MB is greater than {}MB limit)",
        .required >> 20,
        .limit >> 20
    )]
    ImageTooLarge { required: u64, limit: u64 },

    // Hypervisor errors
    #[error("could not get info on domain {domid}: {source}")]
    DomainInfo {
        domid: DomId,
        #[source]
        source: HypercallError,
    },

    #[error("domain lookup returned domain {actual}, expected {expected}")]
    DomainMismatch { expected: DomId, actual: DomId },

    #[error("could not allocate memory for HVM guest: {0}")]
    Populate(#[source] HypercallError),

    #[error("could not free VGA hole: {0}")]
    FreeVgaHole(#[source] HypercallError),

    #[error("could not translate addresses of HVM guest: {0}")]
    Translate(#[source] HypercallError),

    #[error("could not map guest frame {mfn:#x}: {source}")]
    MapFrame {
        mfn: u64,
        #[source]
        source: HypercallError,
    },

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("could not install vCPU context: {0}")]
    SetVcpuContext(#[source] HypercallError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device tree error: {0}")]
    DeviceTree(#[from] FdtError),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments supplied by the caller.
    Configuration,
    /// The boot image (or device tree) is malformed.
    MalformedInput,
    /// The image does not fit in the requested memory.
    ResourceExhaustion,
    /// A privileged call into the hypervisor failed.
    Hypervisor,
    /// Reading or inflating the image failed.
    Io,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMemorySize(_)
            | Error::InvalidVcpuCount(_)
            | Error::ImageRequired
            | Error::ImageNotFound(_) => ErrorKind::Configuration,
            Error::InvalidImage(_) | Error::InvalidGuestAddress(_) | Error::DeviceTree(_) => {
                ErrorKind::MalformedInput
            }
            Error::ImageTooLarge { .. } => ErrorKind::ResourceExhaustion,
            Error::DomainInfo { .. }
            | Error::DomainMismatch { .. }
            | Error::Populate(_)
            | Error::FreeVgaHole(_)
            | Error::Translate(_)
            | Error::MapFrame { .. }
            | Error::SetVcpuContext(_) => ErrorKind::Hypervisor,
            Error::Inflate(_) | Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Wrap a failed mapping of machine frame `mfn`.
    pub(crate) fn map_frame(mfn: u64) -> impl FnOnce(HypercallError) -> Self {
        move |source| Error::MapFrame { mfn, source }
    }
}
