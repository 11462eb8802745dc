#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;

use kestrel_kernel::bootstrap;

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    bootstrap::run(boot_info)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let cpu = kestrel_kernel::arch::x86_64::apic::read_id();
    let rsp: u64;
    let rbp: u64;
    // SAFETY: reads the current stack/frame pointers for diagnostics only;
    // no side effects.
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack));
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }

    kestrel_kernel::println!("[KERNEL PANIC] {}", info);
    match cpu {
        Some(id) => kestrel_kernel::println!("cpu: {id}"),
        None => kestrel_kernel::println!("cpu: unknown (APIC not initialized)"),
    }
    kestrel_kernel::println!("rsp: {rsp:#018x}  rbp: {rbp:#018x}");
    kestrel_kernel::arch::x86_64::context::debug_trace_stack(16);

    kestrel_kernel::arch::halt()
}
