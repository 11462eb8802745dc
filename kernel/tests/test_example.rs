//! Sanity tests for small kernel-wide building blocks that don't need
//! hardware bring-up: synchronization primitives and the IRQ number type.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use kestrel_kernel::{
    exit_qemu, irq::IrqNumber, serial_println, sync::GlobalState, test_panic_handler,
    QemuExitCode,
};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("=== Building Block Tests ===");

    test_global_state_init_once();
    test_irq_number_roundtrip();

    serial_println!("All tests passed!");
    exit_qemu(QemuExitCode::Success)
}

fn test_global_state_init_once() {
    static STATE: GlobalState<u32> = GlobalState::new();
    assert!(STATE.init(1).is_ok());
    assert!(STATE.init(2).is_err(), "double init must fail");
    let seen = STATE.with(|v| *v).expect("state should be initialized");
    assert_eq!(seen, 1);
    serial_println!("  global_state_init_once...[ok]");
}

fn test_irq_number_roundtrip() {
    let irq = IrqNumber::new(9);
    assert_eq!(irq.as_u32(), 9);
    assert_eq!(IrqNumber::from(9u32), irq);
    serial_println!("  irq_number_roundtrip...[ok]");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
