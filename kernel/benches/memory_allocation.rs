//! Heap allocation throughput benchmark across a few size classes.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use kestrel_kernel::{
    arch,
    exit_qemu,
    mm::{self, MemoryRegion},
    serial_println,
    test_panic_handler, BenchmarkRunner, QemuExitCode,
};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("Memory Allocation Benchmark");
    serial_println!("===========================");

    arch::x86_64::early_init();

    let regions: Vec<MemoryRegion> = boot_info
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

    let runner = BenchmarkRunner::new();

    runner.run_benchmark("alloc 64B", || {
        let v: Vec<u8> = Vec::with_capacity(64);
        core::hint::black_box(&v);
    });
    runner.run_benchmark("alloc 4KiB", || {
        let v: Vec<u8> = Vec::with_capacity(4096);
        core::hint::black_box(&v);
    });
    runner.run_benchmark("alloc 64KiB", || {
        let v: Vec<u8> = Vec::with_capacity(65536);
        core::hint::black_box(&v);
    });
    runner.run_benchmark("alloc+free 64B", || {
        let v: Vec<u8> = Vec::with_capacity(64);
        drop(v);
    });

    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
