//! Guest build pipeline.
//!
//! [`HvmBuilder`] drives one build from raw image bytes to an installed
//! vCPU context. The stages run strictly in order and the first failure
//! ends the build; nothing already done to the domain is undone.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::backend::{HvmParam, Hypervisor};
use crate::builder::BuildConfig;
use crate::cpu::{CpuContext, VcpuGuestContext};
use crate::error::{Error, Result};
use crate::firmware::{publish_e820, publish_hvm_info, HvmInfoTable};
use crate::loader::{load_segments, ElfImage, SetupInfo};
use crate::memory::{self, FirmwareMemoryMap, GuestWriter, Mfn};
use crate::{params, shared};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Progress of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Uninitialized,
    ImageValidated,
    MemoryAllocated,
    ImageLoaded,
    FirmwareInfoPublished,
    ContextBuilt,
    /// vCPU 0 is installed and the domain can be scheduled.
    Installed,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Uninitialized => write!(f, "uninitialized"),
            BuildState::ImageValidated => write!(f, "image validated"),
            BuildState::MemoryAllocated => write!(f, "memory allocated"),
            BuildState::ImageLoaded => write!(f, "image loaded"),
            BuildState::FirmwareInfoPublished => write!(f, "firmware info published"),
            BuildState::ContextBuilt => write!(f, "context built"),
            BuildState::Installed => write!(f, "installed"),
            BuildState::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Machine frame of the store page.
    pub store_mfn: Mfn,
    pub setup: SetupInfo,
    pub memory_map: FirmwareMemoryMap,
    pub hvm_info: HvmInfoTable,
    /// Parameters the hypervisor rejected.
    pub failed_params: Vec<HvmParam>,
}

/// Builds one HVM guest into an existing domain.
pub struct HvmBuilder<'h, H: Hypervisor> {
    hv: &'h mut H,
    config: BuildConfig,
    state: BuildState,
}

impl<'h, H: Hypervisor> HvmBuilder<'h, H> {
    pub fn new(hv: &'h mut H, config: BuildConfig) -> Self {
        Self {
            hv,
            config,
            state: BuildState::Uninitialized,
        }
    }

    /// Last state reached.
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Run the pipeline over an uncompressed image.
    pub fn run(&mut self, image: &[u8]) -> Result<BuildOutput> {
        match self.run_stages(image) {
            Ok(output) => Ok(output),
            Err(e) => {
                tracing::error!(
                    domid = self.config.domid,
                    stage = %self.state,
                    error = %e,
                    "build failed"
                );
                self.state = BuildState::Failed;
                Err(e)
            }
        }
    }

    fn run_stages(&mut self, image: &[u8]) -> Result<BuildOutput> {
        let config = self.config.clone();
        let domid = config.domid;

        config.validate()?;
        if image.is_empty() {
            return Err(Error::ImageRequired);
        }

        let image = ElfImage::parse(image)?;
        let setup = *image.setup();
        let (layout, mut pages) = memory::plan(config.memory_mb, &setup)?;
        self.state = BuildState::ImageValidated;

        let info = self
            .hv
            .domain_info(domid)
            .map_err(|source| Error::DomainInfo { domid, source })?;
        if info.domid != domid {
            return Err(Error::DomainMismatch {
                expected: domid,
                actual: info.domid,
            });
        }

        memory::populate(self.hv, domid, &mut pages)?;
        self.state = BuildState::MemoryAllocated;

        load_segments(&image, &mut GuestWriter::new(self.hv, domid, &pages))?;
        self.state = BuildState::ImageLoaded;

        let hvm_info = publish_hvm_info(
            &mut GuestWriter::new(self.hv, domid, &pages),
            config.vcpus,
            config.acpi,
        )?;
        let mut failed_params = params::publish_features(self.hv, domid, config.pae, config.apic);

        let memory_map = FirmwareMemoryMap::build(&layout);
        publish_e820(&mut GuestWriter::new(self.hv, domid, &pages), &memory_map)?;
        self.state = BuildState::FirmwareInfoPublished;

        shared::init_shared_info(self.hv, domid, info.shared_info_frame)?;
        shared::clear_reserved_pages(&mut GuestWriter::new(self.hv, domid, &pages), &layout)?;

        let store_pfn = layout.store_pfn();
        let store_mfn = pages
            .get(store_pfn)
            .ok_or(Error::InvalidGuestAddress(store_pfn << memory::layout::PAGE_SHIFT))?;
        failed_params.extend(params::publish_control_pages(
            self.hv,
            domid,
            &layout,
            config.store_evtchn,
        ));

        let ctxt = VcpuGuestContext::new_hvm(setup.entry_point);
        self.state = BuildState::ContextBuilt;

        self.hv
            .set_vcpu_context(domid, 0, &ctxt)
            .map_err(Error::SetVcpuContext)?;
        self.state = BuildState::Installed;

        tracing::info!(
            domid,
            backend = self.hv.name(),
            arch = VcpuGuestContext::ARCH,
            store_mfn,
            "guest built"
        );

        Ok(BuildOutput {
            store_mfn,
            setup,
            memory_map,
            hvm_info,
            failed_params,
        })
    }
}

/// Build a guest from an uncompressed image.
pub fn build<H: Hypervisor>(hv: &mut H, config: &BuildConfig, image: &[u8]) -> Result<BuildOutput> {
    HvmBuilder::new(hv, config.clone()).run(image)
}

/// Build a guest from an image buffer that may be gzip compressed.
pub fn build_from_buffer<H: Hypervisor>(
    hv: &mut H,
    config: &BuildConfig,
    buffer: &[u8],
) -> Result<BuildOutput> {
    if buffer.is_empty() {
        return Err(Error::ImageRequired);
    }
    let image = inflate(buffer)?;
    build(hv, config, &image)
}

/// Build a guest from an image file that may be gzip compressed.
pub fn build_from_file<H: Hypervisor>(
    hv: &mut H,
    config: &BuildConfig,
    path: impl AsRef<Path>,
) -> Result<BuildOutput> {
    let image = read_image(path)?;
    build_from_buffer(hv, config, &image)
}

/// Read an image file from disk.
pub fn read_image(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::ImageNotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

/// Decompress gzip buffers; anything else is returned as-is.
pub fn inflate(buffer: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !buffer.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(buffer));
    }

    let mut out = Vec::new();
    GzDecoder::new(buffer)
        .read_to_end(&mut out)
        .map_err(Error::Inflate)?;
    tracing::debug!(compressed = buffer.len(), inflated = out.len(), "inflated image");
    Ok(Cow::Owned(out))
}

/// Legacy status code for a build result: 0 on success, -1 on failure.
pub fn exit_status(result: &Result<BuildOutput>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}
