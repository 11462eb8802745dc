//! Application-processor bring-up.
//!
//! The BSP walks the MADT's enabled Local APIC entries (see
//! [`crate::arch::x86_64::acpi::find_madt_cpus`]) and brings each other one
//! up with the Intel MP Specification INIT-deassert-STARTUP sequence,
//! handing it a private stack and [`ap_entry`] as its first Rust code
//! through [`crate::arch::x86_64::trampoline`]. There is no further
//! topology awareness (NUMA nodes, cache domains, hyperthread siblings) --
//! every CPU is an interchangeable slot in a flat array.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use alloc::boxed::Box;

use crate::arch::x86_64::{apic, context, gdt, idt, trampoline};
use crate::error::{KernelError, KernelResult};
use crate::mm::vmm;

use super::scheduler;
use super::task::{Priority, SchedClass, Thread};

/// Upper bound on the number of CPUs this kernel can track. Matches the
/// fixed-size per-CPU arrays in [`crate::arch::x86_64::gdt`] and
/// [`super::queue`].
pub const MAX_CPUS: usize = 16;

const AP_STACK_SIZE: usize = 64 * 1024;

#[repr(align(16))]
struct ApStack([u8; AP_STACK_SIZE]);

struct CpuRecord {
    apic_id: AtomicU32,
    online: AtomicBool,
}

impl CpuRecord {
    const fn empty() -> Self {
        Self {
            apic_id: AtomicU32::new(0),
            online: AtomicBool::new(false),
        }
    }
}

static CPUS: [CpuRecord; MAX_CPUS] = [const { CpuRecord::empty() }; MAX_CPUS];

/// Number of MADT-enumerated CPUs known (including the BSP), filled in by
/// [`init`]. Until `init` runs this is `1` (the BSP alone).
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Record the BSP's own APIC ID as CPU slot 0. Must run once, after
/// [`crate::arch::x86_64::apic::init`], before [`init`] or
/// [`current_cpu_id`].
pub fn init_bsp() {
    let bsp_id = apic::read_id().unwrap_or(0) as u32;
    CPUS[0].apic_id.store(bsp_id, Ordering::Release);
    CPUS[0].online.store(true, Ordering::Release);
}

/// The calling CPU's logical slot index (0 for the BSP), derived from its
/// Local APIC ID.
pub fn current_cpu_id() -> usize {
    let id = apic::read_id().unwrap_or(0) as u32;
    let count = CPU_COUNT.load(Ordering::Acquire);
    for i in 0..count {
        if CPUS[i].apic_id.load(Ordering::Acquire) == id {
            return i;
        }
    }
    0
}

/// Number of CPUs that have reported themselves online (BSP included).
pub fn online_cpu_count() -> usize {
    (0..CPU_COUNT.load(Ordering::Acquire))
        .filter(|&i| CPUS[i].online.load(Ordering::Acquire))
        .count()
}

/// Bring up every other enabled CPU named in the MADT.
///
/// No-op (not an error) if the MADT lists no usable APs, so callers can
/// unconditionally invoke this on single-CPU hardware.
pub fn init() -> KernelResult<()> {
    let Some(madt_cpus) = crate::arch::x86_64::acpi::find_madt_cpus() else {
        return Ok(());
    };

    let bsp_apic_id = CPUS[0].apic_id.load(Ordering::Acquire);
    let kernel_pml4 = vmm::kernel_pml4();

    let aps: alloc::vec::Vec<_> = madt_cpus
        .into_iter()
        .filter(|&(apic_id, _, usable)| usable && apic_id != bsp_apic_id)
        .collect();

    if aps.is_empty() {
        return Ok(());
    }

    trampoline::map_for_bringup()?;

    let mut next_slot = 1;
    for (apic_id, _acpi_id, _usable) in aps {
        if next_slot >= MAX_CPUS {
            println!("[SMP] MAX_CPUS ({}) reached, leaving remaining APs parked", MAX_CPUS);
            break;
        }
        let slot = next_slot;
        next_slot += 1;

        CPUS[slot].apic_id.store(apic_id, Ordering::Release);

        let stack = Box::leak(Box::new(ApStack([0; AP_STACK_SIZE])));
        let stack_top = (stack as *mut ApStack as u64) + AP_STACK_SIZE as u64;

        trampoline::prepare(ap_entry, kernel_pml4, stack_top, slot as u64)?;

        bring_up_one(apic_id, slot)?;
    }

    CPU_COUNT.store(next_slot, Ordering::Release);
    trampoline::unmap_after_bringup()?;

    println!("[SMP] {} application processor(s) online", online_cpu_count() - 1);
    Ok(())
}

/// Run the INIT-deassert-STARTUP sequence for one AP and wait for it to
/// claim the trampoline page, per the Intel MultiProcessor Specification
/// 1.4 section B.4 timing (10ms after INIT, 1ms after the first SIPI, a
/// second SIPI if the first goes unanswered, fatal after ~1s total).
fn bring_up_one(apic_id: u32, slot: usize) -> KernelResult<()> {
    apic::send_init_ipi(apic_id as u8)?;
    delay_ms(10);

    for attempt in 0..2 {
        apic::send_startup_ipi(apic_id as u8, trampoline::TRAMPOLINE_PAGE)?;
        delay_ms(1);

        let poll_budget_ms = if attempt == 0 { 100 } else { 900 };
        for _ in 0..poll_budget_ms {
            if trampoline::ready_flag() {
                CPUS[slot].online.store(true, Ordering::Release);
                return Ok(());
            }
            delay_ms(1);
        }
    }

    Err(KernelError::Timeout {
        operation: "application processor startup",
        duration_ms: 1000,
    })
}

fn delay_ms(ms: u32) {
    for _ in 0..ms {
        apic::pit_stall_micros(1000);
    }
}

/// First Rust code an AP runs, in 64-bit long mode with its own stack and
/// the kernel's page tables already loaded by the trampoline. `cpu_arg` is
/// this CPU's logical slot index, handed through the trampoline's cell
/// protocol.
extern "C" fn ap_entry(cpu_arg: u64) -> ! {
    let cpu = cpu_arg as usize;

    gdt::init(cpu);
    idt::init();
    apic::init_ap().expect("AP local APIC init failed");
    if let Some((divide, ticks_per_ms)) = apic::timer_config() {
        apic::setup_timer(idt::VECTOR_TIMER_TICK, divide, ticks_per_ms * super::QUANTUM_MS)
            .expect("AP timer setup failed");
    }
    context::init_fpu();

    let stack_top: u64;
    // SAFETY: reads the stack pointer set up by the trampoline for this
    // CPU, purely for bookkeeping (the CPU is already running on it).
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) stack_top, options(nomem, nostack));
    }

    let idle = Thread::spawn_running(stack_top, Priority::Idle, SchedClass::Idle, cpu);
    scheduler::set_current(cpu, idle);

    x86_64::instructions::interrupts::enable();

    loop {
        crate::arch::x86_64::idle();
    }
}
