//! hvmbuild CLI tool
//!
//! Inspects firmware images and device tree blobs, and dry-runs guest
//! builds against the simulated hypervisor.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use hvmbuild::backend::sim::SimHypervisor;
use hvmbuild::backend::{DomId, HvmParam};
use hvmbuild::fdt::{DeviceTree, EarlyInfo};
use hvmbuild::loader::ElfImage;
use hvmbuild::{build_from_file, exit_status, inflate, read_image, BuildConfig};

#[derive(Debug, Parser)]
#[command(name = "hvmbuild", version, about = "HVM guest builder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a firmware image and show its layout
    Inspect {
        /// ELF image, optionally gzip compressed
        image: PathBuf,
    },
    /// Build a guest into a simulated domain and show what it sees
    Build {
        image: PathBuf,
        /// Guest memory in MB
        #[arg(long, default_value_t = 128)]
        memory: u32,
        #[arg(long, default_value_t = 1)]
        vcpus: u32,
        #[arg(long)]
        pae: bool,
        #[arg(long)]
        acpi: bool,
        #[arg(long)]
        apic: bool,
        #[arg(long, default_value_t = 0)]
        store_evtchn: u32,
        #[arg(long, default_value_t = 1)]
        domid: DomId,
    },
    /// Scan a flattened device tree blob
    Dtb {
        blob: PathBuf,
        /// Print every node and property name
        #[arg(long)]
        dump: bool,
    },
}

fn main() {
    hvmbuild::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Inspect { image } => cmd_inspect(image),
        Command::Build {
            image,
            memory,
            vcpus,
            pae,
            acpi,
            apic,
            store_evtchn,
            domid,
        } => BuildConfig::builder(domid)
            .memory_mb(memory)
            .vcpus(vcpus)
            .pae(pae)
            .acpi(acpi)
            .apic(apic)
            .store_evtchn(store_evtchn)
            .build()
            .context("invalid build configuration")
            .and_then(|config| cmd_build(image, config)),
        Command::Dtb { blob, dump } => cmd_dtb(blob, dump),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn cmd_inspect(path: PathBuf) -> Result<()> {
    let raw = read_image(&path)?;
    let data = inflate(&raw)?;
    let image = ElfImage::parse(&data).with_context(|| format!("{}", path.display()))?;
    let setup = image.setup();

    println!("Image: {}", path.display());
    println!("  kernel:   {:#010x} - {:#010x}", setup.kernel_start, setup.kernel_end);
    println!("  declared entry: {:#010x}", image.declared_entry());
    println!("  runtime entry:  {:#010x}", setup.entry_point);
    println!("Segments:");
    for seg in image.segments() {
        println!(
            "  paddr {:#010x} filesz {:#x} memsz {:#x} flags {:#x}",
            seg.paddr, seg.filesz, seg.memsz, seg.flags
        );
    }
    let sections = image.section_names();
    if !sections.is_empty() {
        println!("Sections: {}", sections.join(" "));
    }
    Ok(())
}

fn cmd_build(path: PathBuf, config: BuildConfig) -> Result<()> {
    let mut hv = SimHypervisor::new();
    hv.create_domain(config.domid);

    let result = build_from_file(&mut hv, &config, &path);
    let status = exit_status(&result);
    let output = result.with_context(|| format!("building {}", path.display()))?;

    println!("Domain {} built (status {status})", config.domid);
    println!("Memory map:");
    print!("{}", output.memory_map);
    println!("Boot info: {}", output.hvm_info);
    println!("Parameters:");
    for param in HvmParam::ALL {
        match hv.param(config.domid, param) {
            Some(value) => println!("  {param:<14} {value:#x}"),
            None => println!("  {param:<14} -"),
        }
    }
    for param in &output.failed_params {
        println!("  warning: {param} was rejected");
    }
    println!("Store frame: {:#x}", output.store_mfn);
    Ok(())
}

fn cmd_dtb(path: PathBuf, dump: bool) -> Result<()> {
    let blob = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let tree = DeviceTree::parse(&blob)?;

    if dump {
        print!("{}", tree.dump()?);
    }
    if let Some(args) = tree.bootargs()? {
        println!("bootargs: {args}");
    }
    let info = EarlyInfo::scan(&tree)?;
    print!("{info}");
    println!("CPUs: {:?}", info.possible_cpus);
    if let Some(gic) = info.gic {
        println!(
            "GIC: dist {:#x} cpu {:#x} hyp {:#x} vcpu {:#x}",
            gic.dist_addr, gic.cpu_addr, gic.hyp_addr, gic.vcpu_addr
        );
    }
    Ok(())
}
