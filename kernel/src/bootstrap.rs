//! Kernel boot sequence.
//!
//! `run` is the only entry point `main.rs` calls. It owns the one-time
//! order subsystems must come up in -- memory before interrupts before
//! scheduling -- and never returns.

use bootloader_api::BootInfo;

use crate::arch;
use crate::error::KernelResult;
use crate::mm::{self, MemoryRegion};
use crate::sched;

/// Run the full boot sequence and hand off to the scheduler. Does not
/// return.
pub fn run(boot_info: &'static mut BootInfo) -> ! {
    if let Err(e) = kernel_init(boot_info) {
        // Panic is intentional: a failure this early leaves no subsystem
        // available to recover through.
        panic!("boot sequence failed: {:?}", e);
    }

    println!("[BOOT] kernel ready");
    sched::start();
}

fn kernel_init(boot_info: &'static mut BootInfo) -> KernelResult<()> {
    crate::logger::init(log::LevelFilter::Info);

    arch::x86_64::early_init();
    println!("[BOOT] CPU, GDT, IDT initialized");

    let regions = collect_memory_regions(boot_info);
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory mapping");
    mm::init(&regions, phys_mem_offset)?;

    crate::irq::init()?;

    let rsdp_phys = boot_info
        .rsdp_addr
        .into_option()
        .expect("bootloader did not report the RSDP address") as usize;
    arch::x86_64::acpi::init(rsdp_phys)?;

    arch::x86_64::apic::init()?;
    println!("[BOOT] local/IO APIC initialized");

    let bsp_stack_top = current_stack_pointer();
    sched::init(bsp_stack_top)?;
    println!(
        "[BOOT] scheduler initialized, {} CPU(s) online",
        sched::online_cpu_count()
    );

    arch::enable_interrupts();

    Ok(())
}

/// Translate the bootloader's `MemoryRegions` into the architecture-
/// independent form [`mm::init`] expects.
fn collect_memory_regions(boot_info: &BootInfo) -> alloc::vec::Vec<MemoryRegion> {
    use bootloader_api::info::MemoryRegionKind;

    boot_info
        .memory_regions
        .iter()
        .map(|r| MemoryRegion {
            start: r.start,
            size: r.end.saturating_sub(r.start),
            usable: matches!(r.kind, MemoryRegionKind::Usable),
        })
        .collect()
}

/// The calling CPU's current stack pointer, used to seed the bootstrap
/// thread's `kernel_stack_top`. Only ever called once, from the stack
/// `main.rs`'s entry point is still running on.
fn current_stack_pointer() -> u64 {
    let sp: u64;
    // SAFETY: reads `rsp` with no side effects; used purely as a bookkeeping
    // value for the TSS `RSP0` slot this CPU already owns.
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack));
    }
    sp
}
