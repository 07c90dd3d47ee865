use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use kvm86_core::cpu::{set_seg, RunMode};
use kvm86_core::{dos, mz, Vm};

#[derive(Parser)]
#[command(name = "kvm86", about = "Run real-mode DOS-era guests under KVM")]
struct Args {
    /// Floppy image (DOS-kernel mode), or an .EXE for direct execution
    image: PathBuf,

    /// Command tail passed to a direct executable's PSP
    tail: Option<String>,

    /// Boot the image's first sector at 0000:7C00 instead of loading DOS
    #[arg(long, default_value_t = false)]
    boot: bool,

    /// Dump the final register snapshot to this file as JSON
    #[arg(long)]
    dump_state: Option<PathBuf>,

    /// Print full register state after DOS kernel initialization
    #[arg(long, default_value_t = false)]
    debug_init: bool,
}

fn is_executable(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut vm = Vm::new().context("failed to create the VM (is /dev/kvm available?)")?;

    if args.boot {
        vm.set_floppy(&args.image)
            .with_context(|| format!("failed to open {}", args.image.display()))?;
        vm.load_boot_sector()?;
        let layout = vm.layout;
        vm.cpu.setup(&layout, RunMode::BootSector);
    } else if is_executable(&args.image) {
        let layout = vm.layout;
        vm.cpu.setup(&layout, RunMode::Explicit);
        let tail = args.tail.as_deref().unwrap_or("");
        mz::load(&mut vm, &args.image, tail)
            .with_context(|| format!("failed to load {}", args.image.display()))?;
    } else {
        vm.set_floppy(&args.image)
            .with_context(|| format!("failed to open {}", args.image.display()))?;
        dos::install_dos_kernel(&mut vm)?;
        let layout = vm.layout;
        vm.cpu.setup(&layout, RunMode::DosKernel);
        set_seg(&mut vm.cpu.sregs.es, layout.dos_seg);
        set_seg(&mut vm.cpu.sregs.ds, layout.dos_io_seg);

        // Run the kernel's initialization entry; it far-returns to the
        // monitor once its driver tables are wired up.
        debug!("starting DOS kernel initialization");
        vm.far_call(layout.dos_seg, 0);
        vm.run_until_return()?;
        if args.debug_init {
            vm.cpu.dump_regs();
        }
        dos::start_command_interpreter(&mut vm)?;
    }

    let result = vm.run_until_return();

    if let Some(path) = &args.dump_state {
        let snapshot = vm.cpu.snapshot();
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    result?;
    Ok(())
}
