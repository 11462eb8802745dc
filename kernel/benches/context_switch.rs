//! Context switch latency benchmark.
//!
//! Boots the kernel for real, spawns a thread that bounces control straight
//! back via `yield_now`, and times the round trip with the TSC.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use kestrel_kernel::{
    arch,
    exit_qemu,
    mm::{self, MemoryRegion},
    sched::{self, Priority, SchedClass},
    serial_println,
    test_panic_handler, BenchmarkRunner, QemuExitCode,
};

entry_point!(kernel_main);

const ITERATIONS: u64 = 1000;

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("Context Switch Benchmark");
    serial_println!("========================");

    arch::x86_64::early_init();

    let regions: alloc::vec::Vec<MemoryRegion> = boot_info
        .memory_regions
        .iter()
        .map(|r| MemoryRegion {
            start: r.start,
            size: r.end.saturating_sub(r.start),
            usable: matches!(r.kind, bootloader_api::info::MemoryRegionKind::Usable),
        })
        .collect();
    let phys_mem_offset = boot_info.physical_memory_offset.into_option().unwrap();
    mm::init(&regions, phys_mem_offset).expect("mm::init failed");
    kestrel_kernel::irq::init().expect("irq::init failed");

    let rsdp_phys = boot_info.rsdp_addr.into_option().unwrap() as usize;
    arch::x86_64::acpi::init(rsdp_phys).expect("acpi::init failed");
    arch::x86_64::apic::init().expect("apic::init failed");

    let bsp_stack_top = current_stack_pointer();
    sched::init(bsp_stack_top).expect("sched::init failed");

    sched::spawn(bounce_back, Priority::RealTimeHigh, SchedClass::RealTime);
    arch::enable_interrupts();

    let runner = BenchmarkRunner::new();
    let result = runner.run_benchmark("yield round trip", || {
        sched::yield_now();
    });

    serial_println!(
        "yield round trip: avg {} ns, min {} ns, max {} ns ({} iterations)",
        result.avg_time_ns,
        result.min_time_ns,
        result.max_time_ns,
        ITERATIONS
    );

    exit_qemu(QemuExitCode::Success)
}

/// Real-time thread that does nothing but hand control straight back --
/// isolates the two-way switch cost from any work the peer thread does.
extern "C" fn bounce_back() -> ! {
    loop {
        sched::yield_now();
    }
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
