//! Interrupt Descriptor Table.
//!
//! Exceptions that don't need raw register access go through ordinary
//! `extern "x86-interrupt"` handlers. The three preemption-critical
//! vectors -- the scheduler tick (0x20), the reschedule IPI (0x21), and
//! the TLB shootdown IPI (0x22) -- go through naked stubs instead, because
//! `extern "x86-interrupt"` never exposes the raw GPRs a context switch
//! needs to save and restore. Device IRQs (0x30+) are routed through
//! [`crate::irq::dispatch`].

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::apic;
use super::context::CpuContext;
use crate::irq::IrqNumber;

pub const VECTOR_TIMER_TICK: u8 = 0x20;
pub const VECTOR_RESCHEDULE_IPI: u8 = 0x21;
pub const VECTOR_TLB_SHOOTDOWN_IPI: u8 = 0x22;
pub const VECTOR_SPURIOUS: u8 = 0xFF;
pub const VECTOR_DEVICE_BASE: u8 = 0x30;
pub const DEVICE_VECTOR_COUNT: u8 = 16;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: the IST index refers to the double-fault stack set up in
        // `gdt::init`, which has already run on this CPU by the time the
        // IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // SAFETY: these entries point at naked stubs defined below with the
        // exact calling convention the CPU expects for an interrupt gate:
        // no prologue, raw GPR save/restore, explicit `iretq`.
        unsafe {
            idt[VECTOR_TIMER_TICK as usize].set_handler_addr(x86_64::VirtAddr::new(
                timer_tick_entry as usize as u64,
            ));
            idt[VECTOR_RESCHEDULE_IPI as usize].set_handler_addr(x86_64::VirtAddr::new(
                reschedule_ipi_entry as usize as u64,
            ));
            idt[VECTOR_TLB_SHOOTDOWN_IPI as usize].set_handler_addr(x86_64::VirtAddr::new(
                tlb_shootdown_entry as usize as u64,
            ));
            idt[VECTOR_SPURIOUS as usize]
                .set_handler_addr(x86_64::VirtAddr::new(spurious_entry as usize as u64));
        }

        let mut vector = VECTOR_DEVICE_BASE;
        for handler in DEVICE_HANDLERS.iter() {
            idt[vector as usize].set_handler_fn(*handler);
            vector += 1;
        }

        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint hit at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    println!("EXCEPTION: DOUBLE FAULT");
    println!("cpu: {:?}", apic::read_id());
    println!("{:#?}", stack_frame);
    super::context::debug_trace_stack(16);
    panic!("double fault");
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let faulting_address = Cr2::read().expect("page fault with no faulting address");
    super::mmu::handle_page_fault(error_code.bits() as u32, crate::mm::VirtualAddress::new(faulting_address.as_u64()));
    let _ = stack_frame;
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    println!("EXCEPTION: GENERAL PROTECTION FAULT");
    println!("cpu: {:?}", apic::read_id());
    println!("Error Code: {:#x}", error_code);
    println!("{:#?}", stack_frame);
    super::context::debug_trace_stack(16);
    panic!("general protection fault");
}

/// Scheduler tick. Returns the stack pointer to resume on: either the same
/// frame (current thread keeps running) or another thread's saved kernel
/// stack pointer (a switch happened).
extern "C" fn timer_tick_dispatch(frame: *mut CpuContext) -> u64 {
    let next_rsp = crate::sched::scheduler::on_timer_tick(frame);
    apic::send_eoi();
    next_rsp
}

extern "C" fn reschedule_dispatch(frame: *mut CpuContext) -> u64 {
    let next_rsp = crate::sched::scheduler::on_reschedule_ipi(frame);
    apic::send_eoi();
    next_rsp
}

extern "C" fn tlb_shootdown_dispatch(frame: *mut CpuContext) -> u64 {
    crate::mm::vmm::on_tlb_shootdown_ipi();
    apic::send_eoi();
    frame as u64
}

extern "C" fn spurious_dispatch(frame: *mut CpuContext) -> u64 {
    // The spurious vector is never acknowledged with an EOI.
    frame as u64
}

macro_rules! preemption_stub {
    ($name:ident, $vector:expr, $handler:ident) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "push r15",
                "push r14",
                "push r13",
                "push r12",
                "push r11",
                "push r10",
                "push r9",
                "push r8",
                "push rbp",
                "push rdi",
                "push rsi",
                "push rdx",
                "push rcx",
                "push rbx",
                "push rax",
                "mov rdi, rsp",
                "call {handler}",
                "mov rsp, rax",
                "pop rax",
                "pop rbx",
                "pop rcx",
                "pop rdx",
                "pop rsi",
                "pop rdi",
                "pop rbp",
                "pop r8",
                "pop r9",
                "pop r10",
                "pop r11",
                "pop r12",
                "pop r13",
                "pop r14",
                "pop r15",
                "add rsp, 16",
                "iretq",
                vector = const $vector,
                handler = sym $handler,
            );
        }
    };
}

preemption_stub!(timer_tick_entry, VECTOR_TIMER_TICK, timer_tick_dispatch);
preemption_stub!(reschedule_ipi_entry, VECTOR_RESCHEDULE_IPI, reschedule_dispatch);
preemption_stub!(tlb_shootdown_entry, VECTOR_TLB_SHOOTDOWN_IPI, tlb_shootdown_dispatch);
preemption_stub!(spurious_entry, VECTOR_SPURIOUS, spurious_dispatch);

macro_rules! device_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            crate::irq::dispatch(IrqNumber::new($irq));
            apic::send_eoi();
        }
    };
}

device_handler!(device_irq_0, 0);
device_handler!(device_irq_1, 1);
device_handler!(device_irq_2, 2);
device_handler!(device_irq_3, 3);
device_handler!(device_irq_4, 4);
device_handler!(device_irq_5, 5);
device_handler!(device_irq_6, 6);
device_handler!(device_irq_7, 7);
device_handler!(device_irq_8, 8);
device_handler!(device_irq_9, 9);
device_handler!(device_irq_10, 10);
device_handler!(device_irq_11, 11);
device_handler!(device_irq_12, 12);
device_handler!(device_irq_13, 13);
device_handler!(device_irq_14, 14);
device_handler!(device_irq_15, 15);

static DEVICE_HANDLERS: [extern "x86-interrupt" fn(InterruptStackFrame); DEVICE_VECTOR_COUNT as usize] = [
    device_irq_0,
    device_irq_1,
    device_irq_2,
    device_irq_3,
    device_irq_4,
    device_irq_5,
    device_irq_6,
    device_irq_7,
    device_irq_8,
    device_irq_9,
    device_irq_10,
    device_irq_11,
    device_irq_12,
    device_irq_13,
    device_irq_14,
    device_irq_15,
];
