//! Build configuration.

use crate::backend::DomId;
use crate::error::{Error, Result};
use crate::memory::MemoryLayout;
use crate::shared::MAX_VIRT_CPUS;

/// Parameters of one guest build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Domain to populate. It must already exist.
    pub domid: DomId,
    /// Guest memory in megabytes.
    pub memory_mb: u32,
    pub vcpus: u32,
    pub pae: bool,
    pub acpi: bool,
    pub apic: bool,
    /// Event channel of the store connection.
    pub store_evtchn: u32,
}

impl BuildConfig {
    /// Start configuring a build for `domid`.
    pub fn builder(domid: DomId) -> BuildConfigBuilder {
        BuildConfigBuilder::new(domid)
    }

    /// Check the memory size and vCPU count.
    pub fn validate(&self) -> Result<()> {
        MemoryLayout::new(self.memory_mb)?;
        if self.vcpus == 0 || self.vcpus > MAX_VIRT_CPUS {
            return Err(Error::InvalidVcpuCount(self.vcpus));
        }
        Ok(())
    }
}

/// Builder for [`BuildConfig`].
///
/// # Example
///
/// ```rust
/// use hvmbuild::BuildConfig;
///
/// let config = BuildConfig::builder(7)
///     .memory_mb(256)
///     .vcpus(2)
///     .acpi(true)
///     .apic(true)
///     .build()?;
/// assert_eq!(config.memory_mb, 256);
/// # Ok::<(), hvmbuild::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct BuildConfigBuilder {
    domid: DomId,
    memory_mb: Option<u32>,
    vcpus: Option<u32>,
    pae: bool,
    acpi: bool,
    apic: bool,
    store_evtchn: u32,
}

impl BuildConfigBuilder {
    pub fn new(domid: DomId) -> Self {
        Self {
            domid,
            memory_mb: None,
            vcpus: None,
            pae: false,
            acpi: false,
            apic: false,
            store_evtchn: 0,
        }
    }

    /// Set the amount of guest memory in megabytes.
    ///
    /// Default: 128 MB
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Set the number of virtual CPUs.
    ///
    /// Default: 1
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = Some(count);
        self
    }

    pub fn pae(mut self, enabled: bool) -> Self {
        self.pae = enabled;
        self
    }

    pub fn acpi(mut self, enabled: bool) -> Self {
        self.acpi = enabled;
        self
    }

    pub fn apic(mut self, enabled: bool) -> Self {
        self.apic = enabled;
        self
    }

    pub fn store_evtchn(mut self, port: u32) -> Self {
        self.store_evtchn = port;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<BuildConfig> {
        let config = BuildConfig {
            domid: self.domid,
            memory_mb: self.memory_mb.unwrap_or(128),
            vcpus: self.vcpus.unwrap_or(1),
            pae: self.pae,
            acpi: self.acpi,
            apic: self.apic,
            store_evtchn: self.store_evtchn,
        };
        config.validate()?;
        Ok(config)
    }
}
