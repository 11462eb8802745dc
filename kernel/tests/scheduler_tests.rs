//! Scheduler integration tests.
//!
//! Boots far enough to bring up memory management and the scheduler for
//! real, spawns a handful of kernel threads, and checks they actually get
//! time on the CPU and yield cooperatively.

#![no_std]
#![no_main]

extern crate alloc;

use core::{
    panic::PanicInfo,
    sync::atomic::{AtomicU32, Ordering},
};

use bootloader_api::{entry_point, BootInfo};
use kestrel_kernel::{
    arch,
    exit_qemu,
    mm::{self, MemoryRegion},
    sched::{self, Priority, SchedClass},
    serial_println,
    test_panic_handler, QemuExitCode,
};

entry_point!(kernel_main);

static RAN: AtomicU32 = AtomicU32::new(0);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("=== Scheduler Tests ===");

    arch::x86_64::early_init();

    let regions: alloc::vec::Vec<MemoryRegion> = boot_info
        .memory_regions
        .iter()
        .map(|r| MemoryRegion {
            start: r.start,
            size: r.end.saturating_sub(r.start),
            usable: matches!(
                r.kind,
                bootloader_api::info::MemoryRegionKind::Usable
            ),
        })
        .collect();
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("no physical memory offset from bootloader");
    mm::init(&regions, phys_mem_offset).expect("mm::init failed");

    kestrel_kernel::irq::init().expect("irq::init failed");

    let rsdp_phys = boot_info
        .rsdp_addr
        .into_option()
        .expect("no RSDP address from bootloader") as usize;
    arch::x86_64::acpi::init(rsdp_phys).expect("acpi::init failed");
    arch::x86_64::apic::init().expect("apic::init failed");

    let bsp_stack_top = current_stack_pointer();
    sched::init(bsp_stack_top).expect("sched::init failed");

    test_spawn_runs_thread();
    test_priority_ordering();
    test_yield_does_not_crash();

    serial_println!("All scheduler tests passed!");
    exit_qemu(QemuExitCode::Success)
}

/// A spawned thread should actually run once interrupts start firing.
fn test_spawn_runs_thread() {
    RAN.store(0, Ordering::Relaxed);
    sched::spawn(mark_ran, Priority::UserNormal, SchedClass::Normal);

    arch::enable_interrupts();
    for _ in 0..10_000_000 {
        if RAN.load(Ordering::Relaxed) != 0 {
            break;
        }
        core::hint::spin_loop();
    }
    assert_eq!(RAN.load(Ordering::Relaxed), 1, "spawned thread never ran");
    serial_println!("  spawn_runs_thread...[ok]");
}

extern "C" fn mark_ran() -> ! {
    RAN.store(1, Ordering::Relaxed);
    loop {
        sched::yield_now();
    }
}

/// Real-time threads must be scheduled ahead of normal ones; spawning both
/// and giving them a moment to run should favor the real-time thread first.
/// We can't observe interleaving directly from outside, so this checks the
/// weaker but still meaningful property that spawning at every priority
/// level succeeds and yields distinct thread identifiers.
fn test_priority_ordering() {
    let rt = sched::spawn(idle_forever, Priority::RealTimeHigh, SchedClass::RealTime);
    let normal = sched::spawn(idle_forever, Priority::UserNormal, SchedClass::Normal);
    let low = sched::spawn(idle_forever, Priority::UserLow, SchedClass::Normal);
    assert_ne!(rt, normal);
    assert_ne!(normal, low);
    serial_println!("  priority_ordering...[ok]");
}

extern "C" fn idle_forever() -> ! {
    loop {
        sched::yield_now();
    }
}

/// Voluntarily yielding from the bootstrap thread itself must return
/// normally rather than hang or fault.
fn test_yield_does_not_crash() {
    for _ in 0..16 {
        sched::yield_now();
    }
    serial_println!("  yield_does_not_crash...[ok]");
}

fn current_stack_pointer() -> u64 {
    let sp: u64;
    // SAFETY: reads rsp with no side effects.
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack));
    }
    sp
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
