//! # hvmbuild
//!
//! Bootstraps a hardware-virtualized guest domain: loads a 32-bit ELF
//! firmware image into a freshly created domain, lays out its physical
//! memory, publishes the tables the firmware reads at boot and hands the
//! hypervisor an initial vCPU context.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hvmbuild::backend::sim::SimHypervisor;
//! use hvmbuild::{build_from_file, BuildConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let mut hv = SimHypervisor::new();
//!     hv.create_domain(1);
//!
//!     let config = BuildConfig::builder(1)
//!         .memory_mb(256)
//!         .vcpus(2)
//!         .acpi(true)
//!         .build()?;
//!     let output = build_from_file(&mut hv, &config, "hvmloader")?;
//!     println!("store frame: {:#x}", output.store_mfn);
//!     Ok(())
//! }
//! ```
//!
//! The [`fdt`] module is a separate, read-only device tree scanner used by
//! the hypervisor at early boot.

pub mod backend;
mod build;
mod builder;
pub mod cpu;
mod error;
pub mod fdt;
pub mod firmware;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod params;
pub mod shared;

pub use build::{
    build, build_from_buffer, build_from_file, exit_status, inflate, read_image, BuildOutput,
    BuildState, HvmBuilder,
};
pub use builder::{BuildConfig, BuildConfigBuilder};
pub use error::{Error, ErrorKind, Result};
