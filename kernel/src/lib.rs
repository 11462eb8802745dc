//! Kestrel kernel library.
//!
//! Provides the kernel's core subsystems as a library crate so that host
//! tests can exercise pure logic (bitmap allocators, queue ordering, TLSF
//! bookkeeping) without booting real hardware, while `main.rs` links the
//! same crate into the bare-metal binary.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(all(test, target_os = "none"), feature(custom_test_frameworks))]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// naked_functions has been stable since Rust 1.88.0.
#![cfg_attr(all(test, target_os = "none"), test_runner(crate::test_runner))]
#![cfg_attr(all(test, target_os = "none"), reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare metal the kernel owns a TLSF heap backed by the VMM/PMM. On the
// host target (used for `cargo test`), delegate to the system allocator so
// ordinary `Vec`/`String`/`Box` work in unit tests.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use mm::heap::TlsfHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: TlsfHeap = TlsfHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Reference to the global allocator, used by `mm::heap::init` to hand the
/// TLSF arena its backing region once the direct-mapping window is live.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static TlsfHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

mod intrinsics;

pub mod arch;
pub mod bootstrap;
pub mod error;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;

mod test_framework;

// Re-exported for tests and benchmarks.
pub use mm::{FrameNumber, MemoryRegion, FRAME_SIZE};
pub use sched::{Priority, SchedClass, Thread};
#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{
    cycles_to_ns, exit_qemu, read_timestamp, test_panic_handler, BenchmarkRunner, QemuExitCode,
    Testable,
};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
